use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Initializes the process-wide tracing subscriber from the numeric config
/// level (0 = debug .. 3 = error, 4 = silent). Safe to call more than once.
pub fn init_logging(level: u8) {
    let level = match level {
        0 => Level::DEBUG,
        1 => Level::INFO,
        2 => Level::WARN,
        3 => Level::ERROR,
        _ => return,
    };
    INIT.get_or_init(|| {
        let filter = EnvFilter::from_default_env()
            .add_directive(format!("veilgate_core={level}").parse().expect("directive"))
            .add_directive(format!("veilgate={level}").parse().expect("directive"))
            .add_directive("tokio=warn".parse().expect("directive"))
            .add_directive("rustls=warn".parse().expect("directive"))
            .add_directive("sqlx=warn".parse().expect("directive"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init();
    });
}
