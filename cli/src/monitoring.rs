pub fn init_logger(verbose: bool) {
  use tracing::metadata::LevelFilter;
  use tracing_subscriber::fmt::format::FmtSpan;
  use tracing_subscriber::{
    filter::Directive, fmt, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
  };

  let default_directive = if verbose {
    Directive::from(LevelFilter::DEBUG)
  } else {
    Directive::from(LevelFilter::INFO)
  };

  let filter_directives = if let Ok(filter) = std::env::var("RUST_LOG") {
    filter
  } else if verbose {
    "s1flash_cli=debug,s1flash=debug".to_string()
  } else {
    "s1flash_cli=info,s1flash=info".to_string()
  };

  let filter = EnvFilter::builder()
    .with_default_directive(default_directive)
    .parse_lossy(filter_directives);

  tracing_subscriber::registry()
    .with(fmt::layer().with_span_events(FmtSpan::CLOSE).with_filter(filter))
    .init();

  tracing::debug!("initialized logger");
}
