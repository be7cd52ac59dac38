//! Log-init helpers: a `log4rs` rolling file appender per concern, split
//! into an `app` logger
//! (engine lifecycle: splits, merges, checkpoint begin/end) and a
//! `metrics` logger (cache hit/miss/eviction counters), both gated behind
//! the `log` facade so library consumers who never call these functions
//! still compile and link with a no-op logger.

use log::LevelFilter;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::{Path, PathBuf};

const ENCODER_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
const ROLL_TRIGGER_BYTES: u64 = 10 * 1024 * 1024;

/// Initializes logging to `{base_dir}/{engine_name}_logs/`, with separate
/// rolling files for engine-lifecycle events and cache/checkpoint metrics.
///
/// # Errors
/// Returns an error if the log directory cannot be created or the
/// `log4rs` config fails to build.
pub fn init_for_engine_in(
    base_dir: &Path,
    engine_name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut dir = PathBuf::from(base_dir);
    dir.push(format!("{engine_name}_logs"));
    std::fs::create_dir_all(&dir)?;

    let app_log = dir.join(format!("{engine_name}.log"));
    let app_roller = FixedWindowRoller::builder()
        .build(&format!("{}", dir.join(format!("{engine_name}.{{}}.log")).display()), 7)?;
    let app_policy =
        CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_TRIGGER_BYTES)), Box::new(app_roller));
    let app_appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(ENCODER_PATTERN)))
        .build(app_log, Box::new(app_policy))?;

    let metrics_log = dir.join(format!("{engine_name}_metrics.log"));
    let metrics_roller = FixedWindowRoller::builder()
        .build(&format!("{}", dir.join(format!("{engine_name}.metrics.{{}}.log")).display()), 7)?;
    let metrics_policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(ROLL_TRIGGER_BYTES)),
        Box::new(metrics_roller),
    );
    let metrics_appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(ENCODER_PATTERN)))
        .build(metrics_log, Box::new(metrics_policy))?;

    let config = Config::builder()
        .appender(Appender::builder().build("app", Box::new(app_appender)))
        .appender(Appender::builder().build("metrics", Box::new(metrics_appender)))
        .logger(
            Logger::builder()
                .appender("metrics")
                .additive(false)
                .build("bufftree::metrics", LevelFilter::Info),
        )
        .build(Root::builder().appender("app").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}

/// Initializes logging from `log4rs.yaml` in the working directory, for
/// callers that want file-based configuration instead of the programmatic
/// path above.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let _ = log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default());
    Ok(())
}
