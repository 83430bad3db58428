mod test_scheduler;
mod test_worker;

pub mod utils;
