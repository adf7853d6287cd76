/*!
    Cache of slave EEPROM images, so that rescanning a bus does not read again the EEPROMs of unchanged slaves.

    EEPROM reads are slow (a few words per datagram round trip), while the identity probe of a slave is a few datagrams. A cached image is therefore only honored when the identity freshly probed on the slave still matches the identity of the cached image, see [SiiCache::validate].

    The cache is owned by the [crate::Master] and passed to the scanner and slaves, its lifetime is the master session.
*/

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    path::{Path, PathBuf},
    io,
    };
use log::*;

use crate::sii::{SiiImage, Identity};


/// key of a cache entry
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CacheKey {
    /// slave position on the bus
    Position(u16),
    /// slave station alias, stable across topology changes
    Alias(u16),
}
impl CacheKey {
    /// the alias is used when the slave has one, the position otherwise
    pub fn new(position: u16, alias: u16) -> Self {
        if alias != 0
            {Self::Alias(alias)}
        else
            {Self::Position(position)}
    }
}

/// usage counters of a [SiiCache]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub invalidations: usize,
    pub stores: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Arc<SiiImage>>,
    stats: CacheStats,
}

/// EEPROM images already read, by [CacheKey]
#[derive(Default)]
pub struct SiiCache {
    state: Mutex<CacheState>,
}
impl SiiCache {
    pub fn new() -> Self  {Self::default()}

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// cached image, regardless of the slave currently at this key
    pub fn lookup(&self, key: CacheKey) -> Option<Arc<SiiImage>> {
        self.state().entries.get(&key).cloned()
    }
    /// insert or replace an image
    pub fn store(&self, key: CacheKey, image: Arc<SiiImage>) {
        let mut state = self.state();
        trace!("caching eeprom of {} as {:?}", image.identity, key);
        state.stats.stores += 1;
        state.entries.insert(key, image);
    }
    pub fn invalidate(&self, key: CacheKey) {
        let mut state = self.state();
        if state.entries.remove(&key).is_some() {
            debug!("eeprom cache entry {:?} invalidated", key);
            state.stats.invalidations += 1;
        }
    }
    pub fn invalidate_all(&self) {
        let mut state = self.state();
        state.stats.invalidations += state.entries.len();
        state.entries.clear();
    }

    /**
        cached image if its identity matches the identity just probed on the slave

        a mismatching entry is invalidated, so the next read of this slave goes to the wire
    */
    pub fn validate(&self, key: CacheKey, probed: &Identity) -> Option<Arc<SiiImage>> {
        let mut state = self.state();
        match state.entries.get(&key) {
            Some(image) if image.identity == *probed => {
                let image = image.clone();
                state.stats.hits += 1;
                Some(image)
            },
            Some(image) => {
                info!("slave at {:?} changed from {} to {}, cached eeprom dropped", key, image.identity, probed);
                state.entries.remove(&key);
                state.stats.invalidations += 1;
                state.stats.misses += 1;
                None
            },
            None => {
                state.stats.misses += 1;
                None
            },
        }
    }

    pub fn len(&self) -> usize  {self.state().entries.len()}
    pub fn is_empty(&self) -> bool  {self.state().entries.is_empty()}
    pub fn stats(&self) -> CacheStats  {self.state().stats}
}


/// source of EEPROM images replacing the content read from the slaves
pub trait SiiOverride: Send + Sync {
    /// raw EEPROM image for a device, `None` when this source has nothing for it
    fn image(&self, identity: &Identity) -> Option<Vec<u8>>;
}

/**
    EEPROM images stored as files in a directory

    files are named after the identity of the devices they apply to: `{vendor:08x}-{product:08x}-{revision:08x}.bin`
*/
#[derive(Clone, Debug)]
pub struct DirectoryOverride {
    directory: PathBuf,
}
impl DirectoryOverride {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {directory: directory.into()}
    }
    pub fn directory(&self) -> &Path  {&self.directory}
    /// file holding the image of the given device
    pub fn path(&self, identity: &Identity) -> PathBuf {
        self.directory.join(format!("{:08x}-{:08x}-{:08x}.bin",
            identity.vendor, identity.product, identity.revision))
    }
}
impl SiiOverride for DirectoryOverride {
    fn image(&self, identity: &Identity) -> Option<Vec<u8>> {
        let path = self.path(identity);
        match std::fs::read(&path) {
            Ok(image) => {
                debug!("using eeprom override {}", path.display());
                Some(image)
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => None,
            Err(error) => {
                warn!("cannot read eeprom override {}: {}", path.display(), error);
                None
            },
        }
    }
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SimulatedSlave;

    fn image(product: u32, serial: u32) -> Arc<SiiImage> {
        let model = SimulatedSlave::new(0x2, product).serial(serial);
        Arc::new(SiiImage::parse(model.eeprom()).unwrap())
    }

    #[test]
    fn key_prefers_alias() {
        assert_eq!(CacheKey::new(3, 0), CacheKey::Position(3));
        assert_eq!(CacheKey::new(3, 0x20), CacheKey::Alias(0x20));
    }

    #[test]
    fn hit_with_same_identity() {
        let cache = SiiCache::new();
        let stored = image(0x10, 1);
        cache.store(CacheKey::Position(0), stored.clone());

        let found = cache.validate(CacheKey::Position(0), &stored.identity).unwrap();
        assert!(Arc::ptr_eq(&found, &stored));
        assert!(cache.validate(CacheKey::Position(1), &stored.identity).is_none());
        assert_eq!(cache.stats(), CacheStats {hits: 1, misses: 1, invalidations: 0, stores: 1});
    }

    #[test]
    fn changed_identity_invalidates() {
        let cache = SiiCache::new();
        cache.store(CacheKey::Position(0), image(0x10, 1));
        let replaced = image(0x10, 2);

        assert!(cache.validate(CacheKey::Position(0), &replaced.identity).is_none());
        assert!(cache.lookup(CacheKey::Position(0)).is_none());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn explicit_invalidation() {
        let cache = SiiCache::new();
        cache.store(CacheKey::Position(0), image(0x10, 1));
        cache.store(CacheKey::Alias(7), image(0x11, 1));
        cache.invalidate(CacheKey::Position(0));
        assert_eq!(cache.len(), 1);
        cache.invalidate_all();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[test]
    fn override_directory() {
        let directory = std::env::temp_dir().join(format!("ethermaster-override-{}", std::process::id()));
        std::fs::create_dir_all(&directory).unwrap();
        let overrides = DirectoryOverride::new(&directory);

        let model = SimulatedSlave::new(0x2, 0x33).revision(5);
        let identity = Identity {vendor: 0x2, product: 0x33, revision: 5, serial: 0};
        assert_eq!(overrides.path(&identity).file_name().unwrap(), "00000002-00000033-00000005.bin");
        assert!(overrides.image(&identity).is_none());

        std::fs::write(overrides.path(&identity), model.eeprom()).unwrap();
        assert_eq!(overrides.image(&identity), Some(model.eeprom()));
        std::fs::remove_dir_all(&directory).unwrap();
    }
}
