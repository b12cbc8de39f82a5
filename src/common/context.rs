use std::env;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use super::{Arguments, Config, CONFIG_FILENAME};
use crate::prelude::*;

/// Type alias for an atomically-refcounted instance of [`InnerContext`].
pub type Context = Arc<InnerContext>;

/// Inner representation of global program context.
#[derive(Debug)]
pub struct InnerContext {
    pub args: Arguments,
    pub config: Config,
}

impl InnerContext {
    pub fn init() -> Result<Context> {
        let args = Arguments::parse();

        let mut config = match try_locate_config(&env::current_dir()?) {
            Some(path) => Config::from_path(&path.join(CONFIG_FILENAME))?,
            None => Config::default(),
        };

        if let Some(pages) = args.pages_dir() {
            config.pages_dir = pages.clone();
        }

        if args.devel_mode() {
            config.serve.debug = true;
        }

        let ctx = InnerContext { args, config };
        ctx.validate()?;

        Ok(Arc::new(ctx))
    }

    /// Build a context directly from parts, bypassing the CLI and filesystem.
    ///
    /// This is the embedder entrypoint; the core consults nothing else.
    pub fn from_config(args: Arguments, config: Config) -> Context {
        Arc::new(InnerContext { args, config })
    }

    pub fn devel_mode(&self) -> bool {
        self.args.devel_mode()
    }

    pub fn debug_enabled(&self) -> bool {
        self.config.serve.debug
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.config.pages_dir.is_dir(),
            "Pages directory {:?} does not exist or is not a directory.",
            self.config.pages_dir
        );

        Ok(())
    }
}

// Deref abuse to enable easy access to the configuration field.
impl Deref for InnerContext {
    type Target = Config;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

fn try_locate_config(start: &Path) -> Option<PathBuf> {
    let mut path: PathBuf = start.into();
    let target = Path::new(CONFIG_FILENAME);

    loop {
        path.push(target);

        if path.is_file() {
            path.pop();
            break Some(path);
        }

        if !(path.pop() && path.pop()) {
            break None;
        }
    }
}
