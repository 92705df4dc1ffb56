use std::error::Error;

use super::{manager, ConfigArgs};

pub fn run(args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    let plotted = manager(args)?.replot()?;
    println!("replotted {plotted} iteration(s)");
    Ok(())
}
