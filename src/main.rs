use std::{io, time::Instant};

use churnbench::{ChurnConfig, Console, LABEL, ResourceUsage};
use tracing::{info, warn};

fn main() -> io::Result<()> {
  churnbench::init_tracing();

  let config = ChurnConfig::CANONICAL;
  if !config.is_representative() {
    warn!(
      iterations = config.iterations,
      slots = config.slots,
      "fewer than two full passes over the slot table, eviction is barely exercised"
    );
  }
  info!(
    iterations = config.iterations,
    slots = config.slots,
    report_every = config.report_every,
    "starting churn"
  );

  let mut console = Console::new(io::stdout().lock(), LABEL);
  let start = Instant::now();
  let total = churnbench::run(&config, &mut console);
  let elapsed = start.elapsed();
  console.finish(total)?;

  let secs = elapsed.as_secs_f64();
  info!(
    elapsed_ms = elapsed.as_millis() as u64,
    iterations_per_sec = if secs > 0.0 { (config.iterations as f64 / secs) as u64 } else { 0 },
    "churn finished"
  );
  if let Some(usage) = ResourceUsage::current() {
    info!(
      user_ms = usage.user.as_millis() as u64,
      system_ms = usage.system.as_millis() as u64,
      max_rss_kib = usage.max_rss_kib,
      "resource usage"
    );
  }

  Ok(())
}
