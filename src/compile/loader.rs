//! The page loader: compile on demand, cache by absolute path, and keep a
//! reverse dependency map so a file change invalidates every page that
//! (transitively) imports it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use super::generate::{self, normalize_path};
use super::program::PageProgram;
use super::surrogate::CompileFailure;
use crate::parse::PageParser;
use crate::prelude::*;

/// A compiled page with its layout chain and component imports resolved.
#[derive(Debug)]
pub struct LoadedPage {
    pub program: Arc<PageProgram>,
    pub layout: Option<Arc<LoadedPage>>,
    pub components: IndexMap<String, Arc<LoadedPage>>,
}

impl LoadedPage {
    /// The layout chain, innermost first: `self.layout`, its layout, ...
    pub fn layout_chain(&self) -> Vec<Arc<LoadedPage>> {
        let mut chain = Vec::new();
        let mut current = self.layout.clone();
        while let Some(layout) = current {
            current = layout.layout.clone();
            chain.push(layout);
        }
        chain
    }
}

pub struct Loader {
    parser: PageParser,
    pages_root: PathBuf,
    extension: String,
    cache: RwLock<HashMap<PathBuf, Arc<LoadedPage>>>,
    /// dependency file → pages that depend on it.
    dependents: RwLock<HashMap<PathBuf, HashSet<PathBuf>>>,
}

impl Loader {
    pub fn new(ctx: &Context) -> Self {
        Loader {
            parser: PageParser::new(),
            pages_root: normalize_path(&ctx.config.pages_dir),
            extension: ctx.config.source_extension.clone(),
            cache: RwLock::new(HashMap::new()),
            dependents: RwLock::new(HashMap::new()),
        }
    }

    pub fn pages_root(&self) -> &Path {
        &self.pages_root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Compile (or fetch from cache) the page at `path`.
    pub fn load(&self, path: &Path) -> Result<Arc<LoadedPage>, CompileFailure> {
        let path = normalize_path(path);
        let mut visiting = HashSet::new();
        self.load_inner(&path, &mut visiting)
    }

    fn load_inner(
        &self,
        path: &Path,
        visiting: &mut HashSet<PathBuf>,
    ) -> Result<Arc<LoadedPage>, CompileFailure> {
        if let Some(cached) = self.cache.read().unwrap().get(path) {
            return Ok(cached.clone());
        }

        if !visiting.insert(path.to_path_buf()) {
            return Err(CompileFailure::new(
                path,
                format!("circular layout/component dependency through {path:?}"),
                None,
            ));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CompileFailure::new(path, format!("could not read source: {e}"), None))?;

        let parsed = self
            .parser
            .parse(&content, path)
            .map_err(|e| CompileFailure::from_source(path, &e))?;

        // Layout: explicit `!layout` wins, else the nearest `__layout__`
        // file up the directory tree.
        let layout_path = match parsed.layout_directive() {
            Some(rel) => {
                let base = path.parent().unwrap_or(Path::new("/"));
                Some(normalize_path(&base.join(rel)))
            }
            None => self.resolve_implicit_layout(path),
        };

        let program = generate::generate(&parsed, layout_path)
            .map_err(|e| CompileFailure::from_source(path, &e))?;

        for diagnostic in &program.diagnostics {
            warn!("{:?}: {diagnostic}", path);
        }

        let layout = match &program.layout_path {
            Some(layout_path) => Some(self.load_inner(layout_path, visiting)?),
            None => None,
        };

        let mut components = IndexMap::new();
        let mut dependency_paths: HashSet<PathBuf> = HashSet::new();
        if let Some(layout_path) = &program.layout_path {
            dependency_paths.insert(layout_path.clone());
        }
        for (tag, component_path) in &program.components {
            // Fall back to the shared components directory when the
            // file-relative path does not exist.
            let resolved = if component_path.is_file() {
                component_path.clone()
            } else {
                match component_path.file_name() {
                    Some(name) => {
                        let shared = self.pages_root.join("components").join(name);
                        if shared.is_file() {
                            normalize_path(&shared)
                        } else {
                            component_path.clone()
                        }
                    }
                    None => component_path.clone(),
                }
            };
            dependency_paths.insert(resolved.clone());
            components.insert(tag.clone(), self.load_inner(&resolved, visiting)?);
        }

        visiting.remove(path);

        let loaded = Arc::new(LoadedPage {
            program: Arc::new(program),
            layout,
            components,
        });

        {
            let mut dependents = self.dependents.write().unwrap();
            for dep in dependency_paths {
                dependents
                    .entry(dep)
                    .or_default()
                    .insert(path.to_path_buf());
            }
        }
        self.cache
            .write()
            .unwrap()
            .insert(path.to_path_buf(), loaded.clone());

        Ok(loaded)
    }

    /// Drop `path` and everything that transitively depends on it from the
    /// cache. Returns the full set of invalidated page paths.
    pub fn invalidate(&self, path: &Path) -> HashSet<PathBuf> {
        let path = normalize_path(path);
        let mut invalidated = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(path);

        let dependents = self.dependents.read().unwrap();
        while let Some(current) = queue.pop_front() {
            if !invalidated.insert(current.clone()) {
                continue;
            }
            if let Some(importers) = dependents.get(&current) {
                for importer in importers {
                    queue.push_back(importer.clone());
                }
            }
        }
        drop(dependents);

        let mut cache = self.cache.write().unwrap();
        for path in &invalidated {
            cache.remove(path);
        }

        invalidated
    }

    /// Walk parent directories from the page up to the pages root; the first
    /// `__layout__` file found applies, unless the page *is* that file.
    pub fn resolve_implicit_layout(&self, page: &Path) -> Option<PathBuf> {
        let mut dir = page.parent()?;

        loop {
            let candidate = dir.join(format!("{LAYOUT_STEM}.{}", self.extension));
            if candidate != page && candidate.is_file() {
                return Some(normalize_path(&candidate));
            }

            if dir == self.pages_root {
                return None;
            }
            dir = dir.parent()?;
        }
    }

    #[cfg(test)]
    pub fn cached(&self, path: &Path) -> bool {
        self.cache.read().unwrap().contains_key(&normalize_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Arguments, Command, Config, InnerContext};

    fn test_ctx(pages_dir: &Path) -> Context {
        let mut config = Config::default();
        config.pages_dir = pages_dir.to_path_buf();
        let args = Arguments {
            command: Command::Dev { pages: None },
            quiet: true,
            verbose: 0,
        };
        InnerContext::from_config(args, config)
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn temp_pages(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pywire-loader-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loads_and_caches() {
        let root = temp_pages("cache");
        let page = root.join("index.pw");
        write(&page, "<p>hello</p>\n");

        let loader = Loader::new(&test_ctx(&root));
        let first = loader.load(&page).unwrap();
        let second = loader.load(&page).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn implicit_layout_resolution() {
        let root = temp_pages("layout");
        write(&root.join("__layout__.pw"), "<html><body><slot></slot></body></html>\n");
        write(&root.join("blog/post.pw"), "<p>post</p>\n");

        let loader = Loader::new(&test_ctx(&root));
        let page = loader.load(&root.join("blog/post.pw")).unwrap();
        let layout = page.layout.as_ref().expect("layout should attach");
        assert_eq!(
            layout.program.file_path,
            normalize_path(&root.join("__layout__.pw"))
        );
        // The page compiled as slot fills, not a standalone render plan.
        assert!(page.program.render.is_empty());
        assert!(!page.program.slot_fills.is_empty());
    }

    #[test]
    fn layout_does_not_apply_to_itself() {
        let root = temp_pages("self");
        write(&root.join("__layout__.pw"), "<html><slot></slot></html>\n");

        let loader = Loader::new(&test_ctx(&root));
        let layout = loader.load(&root.join("__layout__.pw")).unwrap();
        assert!(layout.layout.is_none());
    }

    #[test]
    fn invalidation_is_transitive() {
        let root = temp_pages("invalidate");
        write(&root.join("__layout__.pw"), "<html><slot></slot></html>\n");
        write(&root.join("a.pw"), "<p>a</p>\n");
        write(&root.join("b.pw"), "<p>b</p>\n");

        let loader = Loader::new(&test_ctx(&root));
        loader.load(&root.join("a.pw")).unwrap();
        loader.load(&root.join("b.pw")).unwrap();

        let invalidated = loader.invalidate(&root.join("__layout__.pw"));
        assert!(invalidated.contains(&normalize_path(&root.join("a.pw"))));
        assert!(invalidated.contains(&normalize_path(&root.join("b.pw"))));
        assert!(!loader.cached(&root.join("a.pw")));
    }

    #[test]
    fn compile_failure_carries_location() {
        let root = temp_pages("failure");
        let page = root.join("broken.pw");
        write(&page, "<p>x</p>\n---\nbad = = 1\n---\n");

        let loader = Loader::new(&test_ctx(&root));
        let failure = loader.load(&page).unwrap_err();
        assert_eq!(failure.line, Some(3));
        assert_eq!(failure.file_path, normalize_path(&page));
    }

    #[test]
    fn component_imports_are_dependencies() {
        let root = temp_pages("component");
        write(&root.join("card.pw"), "!props(title: str)\n<div class=\"card\">{title}</div>\n");
        write(
            &root.join("index.pw"),
            "!component Card './card.pw'\n<Card title=\"hi\"></Card>\n",
        );

        let loader = Loader::new(&test_ctx(&root));
        let page = loader.load(&root.join("index.pw")).unwrap();
        assert!(page.components.contains_key("card"));

        let invalidated = loader.invalidate(&root.join("card.pw"));
        assert!(invalidated.contains(&normalize_path(&root.join("index.pw"))));
    }
}
