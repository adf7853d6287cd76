//! bring the slaves of a real segment to operational state and print what was found

use std::error::Error;
use ethermaster::{EthernetSocket, Master, MasterConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let interface = std::env::args().nth(1).unwrap_or_else(|| "eno1".into());

    let master = Master::new(EthernetSocket::new(&interface)?, MasterConfig::default());
    let state = master.start().await?;
    let topology = master.current_topology();
    println!("master {} with {} slaves answering", state, topology.responders);
    for slave in &topology.slaves {
        println!("  slave {}: {} {:?} - {} - {:?}",
            slave.position,
            slave.identity,
            slave.name.as_deref().unwrap_or(""),
            slave.state,
            slave.capabilities,
            );
        if let Some(fault) = &slave.diagnostics.last_error {
            println!("    last error: {}", fault);
        }
    }
    for gap in &topology.gaps {
        println!("  no slave at position {}: {}", gap.position, gap.reason);
    }
    Ok(())
}
