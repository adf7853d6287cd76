/*!
    Placement of the slaves process data in the logical memory, and the process data image shared between the cyclic exchanges and the user.

    Each slave exchanging process data gets a [Region] of the logical memory: its outputs followed by its inputs. The slave FMMUs map its process data sync managers to this region, so that one logical datagram covering the region exchanges all the slave process data.

    The [ProcessImage] holds the current values of every region. Outputs are written by the user and read by the cyclic exchange, inputs are written by the cyclic exchange and read by the user.
*/

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
    };
use core::ops::Range;
use log::*;

use crate::{
    error::{EthercatError, EthercatResult},
    config::LogicalConfig,
    };


/**
    first-fit allocator of ranges of the logical memory

    released ranges are merged with their free neighbors, so allocating and releasing does not fragment the memory
*/
#[derive(Clone, Debug)]
pub struct Allocator {
    /// free ranges, start -> length
    free: BTreeMap<u32, u32>,
}
impl Allocator {
    pub fn new(base: u32, size: u32) -> Self {
        let mut free = BTreeMap::new();
        if size != 0
            {free.insert(base, size);}
        Self {free}
    }
    /// reserve `size` bytes, return the start logical address
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        let (&start, &length) = self.free.iter().find(|(_, length)| **length >= size)?;
        self.free.remove(&start);
        if length > size
            {self.free.insert(start + size, length - size);}
        Some(start)
    }
    /// give back a range previously allocated
    pub fn release(&mut self, start: u32, size: u32) {
        if size == 0
            {return}
        let mut start = start;
        let mut size = size;
        // merge with the following free range
        if let Some(next) = self.free.remove(&(start + size))
            {size += next;}
        // merge with the preceding free range
        if let Some((&previous, &length)) = self.free.range(.. start).next_back() {
            if previous + length == start {
                start = previous;
                size += length;
            }
        }
        self.free.insert(start, size);
    }
    /// total free bytes
    pub fn available(&self) -> u32 {
        self.free.values().sum()
    }
}


/// logical memory of one slave
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Region {
    /// logical address of the first output byte
    pub logical: u32,
    pub outputs: u16,
    pub inputs: u16,
}
impl Region {
    /// bytes exchanged by a logical datagram over the whole region
    pub fn size(&self) -> usize  {usize::from(self.outputs) + usize::from(self.inputs)}
    pub fn is_empty(&self) -> bool  {self.size() == 0}
    /// logical address of the first input byte
    pub fn inputs_logical(&self) -> u32  {self.logical + u32::from(self.outputs)}
    /// outputs bytes in a buffer covering the region
    pub fn outputs_range(&self) -> Range<usize>  {0 .. usize::from(self.outputs)}
    /// inputs bytes in a buffer covering the region
    pub fn inputs_range(&self) -> Range<usize>  {usize::from(self.outputs) .. self.size()}
}


/// current values of process data of all slaves, indexed by slave position
pub struct ProcessImage {
    base: u32,
    state: Mutex<ImageState>,
}
struct ImageState {
    allocator: Allocator,
    regions: BTreeMap<u16, Region>,
    data: Vec<u8>,
}

impl ProcessImage {
    pub fn new(config: &LogicalConfig) -> Self {
        Self {
            base: config.base,
            state: Mutex::new(ImageState {
                allocator: Allocator::new(config.base, config.size),
                regions: BTreeMap::new(),
                data: vec![0; config.size as usize],
            }),
        }
    }
    fn state(&self) -> MutexGuard<'_, ImageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// position of a region in the image buffer
    fn span(&self, region: &Region) -> Range<usize> {
        let start = (region.logical - self.base) as usize;
        start .. start + region.size()
    }

    /**
        reserve the region of a slave

        an existing region of the same sizes is kept so its offsets remain the same, a region of different sizes is replaced
    */
    pub fn allocate(&self, position: u16, outputs: u16, inputs: u16) -> EthercatResult<Region> {
        let mut state = self.state();
        if let Some(&region) = state.regions.get(&position) {
            if region.outputs == outputs && region.inputs == inputs
                {return Ok(region)}
            self.free(&mut state, position);
        }
        let size = u32::from(outputs) + u32::from(inputs);
        let logical = if size == 0
            {self.base}
            else {state.allocator.allocate(size)
                .ok_or(EthercatError::Master("logical memory exhausted"))?};
        let region = Region {logical, outputs, inputs};
        debug!("slave {} process data at logical {:#x}, {} bytes out, {} bytes in", position, logical, outputs, inputs);
        state.regions.insert(position, region);
        Ok(region)
    }
    /// give back the region of a slave, its content is cleared
    pub fn release(&self, position: u16) -> Option<Region> {
        let mut state = self.state();
        self.free(&mut state, position)
    }
    fn free(&self, state: &mut ImageState, position: u16) -> Option<Region> {
        let region = state.regions.remove(&position)?;
        if ! region.is_empty() {
            let span = self.span(&region);
            state.data[span].fill(0);
            state.allocator.release(region.logical, region.size() as u32);
        }
        Some(region)
    }

    pub fn region(&self, position: u16) -> Option<Region> {
        self.state().regions.get(&position).copied()
    }
    /// all allocated regions, by slave position
    pub fn regions(&self) -> Vec<(u16, Region)> {
        self.state().regions.iter()
            .map(|(&position, &region)| (position, region))
            .collect()
    }
    /// free bytes remaining in the logical memory
    pub fn available(&self) -> u32  {self.state().allocator.available()}

    /// set the outputs of a slave, `data` is written at the start of the outputs and must not be bigger
    pub fn write_outputs(&self, position: u16, data: &[u8]) -> EthercatResult<()> {
        let mut state = self.state();
        let region = *state.regions.get(&position)
            .ok_or(EthercatError::Master("slave has no process data"))?;
        if data.len() > usize::from(region.outputs)
            {return Err(EthercatError::Master("outputs bigger than the slave outputs"))}
        let start = self.span(&region).start;
        state.data[start .. start + data.len()].copy_from_slice(data);
        Ok(())
    }
    /// current outputs of a slave
    pub fn outputs(&self, position: u16) -> Option<Vec<u8>> {
        let state = self.state();
        let region = state.regions.get(&position)?;
        let start = self.span(region).start;
        Some(state.data[start ..][region.outputs_range()].to_vec())
    }
    /// last inputs received from a slave
    pub fn inputs(&self, position: u16) -> Option<Vec<u8>> {
        let state = self.state();
        let region = state.regions.get(&position)?;
        let start = self.span(region).start;
        Some(state.data[start ..][region.inputs_range()].to_vec())
    }

    /// buffer for a logical datagram over the region, with the current outputs
    pub(crate) fn load_outputs(&self, region: &Region) -> Vec<u8> {
        let state = self.state();
        let mut buffer = vec![0; region.size()];
        let span = self.span(region);
        buffer[region.outputs_range()].copy_from_slice(&state.data[span][region.outputs_range()]);
        buffer
    }
    /// save the inputs of a buffer returned by a logical datagram over the region
    pub(crate) fn store_inputs(&self, region: &Region, buffer: &[u8]) {
        let mut state = self.state();
        if buffer.len() < region.size()
            {return}
        let span = self.span(region);
        state.data[span][region.inputs_range()].copy_from_slice(&buffer[region.inputs_range()]);
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_first_fit() {
        let mut allocator = Allocator::new(0x100, 0x40);
        let a = allocator.allocate(0x10).unwrap();
        let b = allocator.allocate(0x10).unwrap();
        let c = allocator.allocate(0x10).unwrap();
        assert_eq!((a, b, c), (0x100, 0x110, 0x120));
        assert!(allocator.allocate(0x20).is_none());

        allocator.release(b, 0x10);
        assert_eq!(allocator.allocate(0x8), Some(0x110));
        assert_eq!(allocator.available(), 0x18);
    }

    #[test]
    fn allocator_merges_released() {
        let mut allocator = Allocator::new(0, 0x30);
        let a = allocator.allocate(0x10).unwrap();
        let b = allocator.allocate(0x10).unwrap();
        let c = allocator.allocate(0x10).unwrap();
        allocator.release(a, 0x10);
        allocator.release(c, 0x10);
        allocator.release(b, 0x10);
        assert_eq!(allocator.allocate(0x30), Some(0));
    }

    #[test]
    fn regions_are_stable() {
        let image = ProcessImage::new(&LogicalConfig {base: 0x1000, size: 0x100});
        let first = image.allocate(0, 4, 2).unwrap();
        let second = image.allocate(1, 2, 2).unwrap();
        assert_eq!(first.logical, 0x1000);
        assert_eq!(second.logical, 0x1006);
        assert_eq!(image.allocate(0, 4, 2).unwrap(), first);

        image.release(0);
        assert_eq!(image.region(1), Some(second));
        assert_eq!(image.available(), 0x100 - 4);
        assert!(image.allocate(2, 0x100, 0).is_err());
    }

    #[test]
    fn outputs_and_inputs() {
        let image = ProcessImage::new(&LogicalConfig::default());
        let region = image.allocate(3, 2, 3).unwrap();
        image.write_outputs(3, &[1, 2]).unwrap();
        assert!(image.write_outputs(3, &[1, 2, 3]).is_err());
        assert!(image.write_outputs(4, &[1]).is_err());

        let mut buffer = image.load_outputs(&region);
        assert_eq!(buffer, [1, 2, 0, 0, 0]);
        buffer[region.inputs_range()].copy_from_slice(&[7, 8, 9]);
        image.store_inputs(&region, &buffer);
        assert_eq!(image.inputs(3), Some(vec![7, 8, 9]));
        assert_eq!(image.outputs(3), Some(vec![1, 2]));

        image.release(3);
        let region = image.allocate(3, 2, 3).unwrap();
        assert_eq!(image.load_outputs(&region), [0; 5]);
    }
}
