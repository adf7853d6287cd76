//! start a master on a simulated segment and run cycles, printing the process data

use std::error::Error;
use core::time::Duration;
use ethermaster::{
    SimulatedBus, SimulatedSlave,
    Master, MasterConfig, CyclicConfig,
    };

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let bus = SimulatedBus::new();
    for i in 0 .. 4 {
        bus.push(SimulatedSlave::new(0x2, 0x100 + i).serial(i + 1));
    }
    let master = Master::new(bus.socket(), MasterConfig {
        cyclic: CyclicConfig {
            period: Duration::from_millis(2),
            ..Default::default()
        },
        ..Default::default()
    });
    println!("master {}", master.start().await?);
    for slave in master.current_topology().slaves {
        println!("  slave {} at {:#x}: {} {:?} {}",
            slave.position, slave.station, slave.identity,
            slave.name.unwrap_or_default(), slave.state);
    }

    for step in 0u8 .. 10 {
        master.process_image().write_outputs(0, &[step; 4])?;
        bus.set_inputs(1, &[step, step+1, step+2, step+3]);
        let report = master.cycle().await?;
        println!("cycle {}: {} exchanged in {:?}, slave 0 received {:?}, slave 1 sent {:?}",
            report.cycle,
            report.exchanged.len(),
            report.elapsed,
            bus.outputs(0),
            master.process_image().inputs(1).unwrap_or_default(),
            );
        tokio::time::sleep(master.config().cyclic.period).await;
    }
    println!("{:?}", master.cyclic_stats());
    Ok(())
}
