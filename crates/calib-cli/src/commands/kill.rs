use std::error::Error;

use super::{manager, ConfigArgs};

pub fn run(args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    match manager(args)?.kill()? {
        Some(job) => println!("cancelled job {} in suite {}", job.job_id, job.suite_id),
        None => println!("no job to cancel"),
    }
    Ok(())
}
