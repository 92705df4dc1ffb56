use std::error::Error;

use super::{manager, ConfigArgs};

pub fn run(args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    let mut manager = manager(args)?;
    manager.cleanup()?;
    println!("removed {}", manager.calibration_dir().display());
    Ok(())
}
