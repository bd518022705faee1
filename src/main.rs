use anyhow::Result;
use kvlock::*;
use log::{info, warn};
use std::env;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let resource = args.get(1).cloned().unwrap_or_else(|| "kvlock".to_string());
    let hold: u64 = match args.get(2) {
        Some(s) => s.parse()?,
        None => 10,
    };

    let url = env::var("KVLOCK_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = Arc::new(RedisClient::connect(&url)?);
    let lock = Lock::builder().store(client).build()?;

    // Ctrl-C aborts a pending acquire, or ends the hold early.
    let cancel = Cancel::new();
    let c = cancel.clone();
    ctrlc::set_handler(move || c.cancel())?;

    match lock.try_acquire(&resource, &cancel)? {
        Acquired::Held(token) => {
            info!("holding {} for {hold}s", token.key());
            if cancel.wait(Duration::from_secs(hold)) {
                info!("interrupted");
            }

            lock.release_token(token)?;
        }
        Acquired::TimedOut => warn!("{resource} is busy, giving up"),
        Acquired::Cancelled => info!("cancelled"),
    }

    Ok(())
}
