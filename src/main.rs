#![warn(clippy::all)]

mod code;
mod common;
mod compile;
mod parse;
mod route;
mod runtime;
mod serve;
mod watch;

mod prelude {
    pub use color_eyre::eyre::{bail, ensure, eyre, Context as EyreContext, ContextCompat};
    pub use color_eyre::{Report, Result, Section};
    pub use indoc::indoc;
    pub use tracing::{debug, error, info, warn};

    pub use crate::common::*;
}

use prelude::*;

fn main() {
    install_logging();

    let ctx = match InnerContext::init() {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Failed to initialize: {e:?}");
            std::process::exit(1);
        }
    };

    if let Err(e) = serve::Server::new(&ctx).and_then(|server| server.serve()) {
        error!("Server terminated abnormally: {e:?}");
        std::process::exit(1);
    }
}

fn install_logging() {
    use color_eyre::config::HookBuilder;
    use tracing_error::ErrorLayer;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();

    HookBuilder::new()
        .panic_section(indoc! {
            "Well, this is embarassing. It appears PyWire has crashed!
            Consider reporting the bug to the maintainers."
        })
        .display_env_section(false)
        .display_location_section(false)
        .install()
        .expect("Could not install Eyre hooks!");

    info!("Logging installed.")
}
