use clap::Args;
use console::{Emoji, Style, StyledObject};
use once_cell::sync::Lazy;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::EnvFilter;

#[derive(Debug, Args)]
pub struct OutputArgs {
    /// Increase verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Reduce verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,
}

static ERROR: Lazy<StyledObject<Emoji<'static, 'static>>> = Lazy::new(|| {
    Style::new()
        .red()
        .bold()
        .for_stderr()
        .apply_to(Emoji("🛑 Error:", "Error:"))
});

static WARNING: Lazy<StyledObject<Emoji<'static, 'static>>> = Lazy::new(|| {
    Style::new()
        .yellow()
        .bold()
        .for_stderr()
        .apply_to(Emoji("⚠️  Warning:", "Warning:"))
});

static OK: Lazy<StyledObject<Emoji<'static, 'static>>> =
    Lazy::new(|| Style::new().green().bold().apply_to(Emoji("✓", "ok:")));

pub fn init(args: &OutputArgs) {
    let verbosity = args.verbose as i8 - args.quiet as i8;
    let level = match verbosity {
        2.. => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        0 => LevelFilter::INFO,
        -1 => LevelFilter::WARN,
        _ => LevelFilter::ERROR,
    };
    // ISLAND_LOG overrides the -v/-q derived level
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("ISLAND_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn success(message: &str) {
    println!("{} {message}", &*OK);
}

pub fn warning(message: &str) {
    eprintln!("{} {message}", &*WARNING);
}

pub fn error(message: &str) {
    eprintln!("{} {message}", &*ERROR);
}
