//! Module loader confined to the bundle root.
//!
//! - No remote, `data:`, `blob:` or `node:` specifiers
//! - No escape from the root (checked on the canonical path, so symlinks
//!   and `..` are covered)
//! - Only `.js` and `.mjs` files

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};
use std::path::{Path, PathBuf};

const FORBIDDEN_SCHEMES: &[&str] = &["http:", "https:", "data:", "blob:", "node:", "npm:", "jsr:"];

pub struct SandboxedLoader {
    root: PathBuf,
}

impl SandboxedLoader {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|e| anyhow!("Bundle root '{}' is unusable: {}", root.as_ref().display(), e))?;
        if !root.is_dir() {
            return Err(anyhow!("Bundle root '{}' is not a directory", root.display()));
        }
        Ok(Self { root })
    }

    /// Canonical path of `path` if it is an allowed module inside the root.
    fn admit(&self, path: &Path) -> Result<PathBuf, Error> {
        let canonical = path
            .canonicalize()
            .map_err(|_| anyhow!("Module not found: {}", path.display()))?;
        if !canonical.starts_with(&self.root) {
            tracing::debug!(path = %path.display(), "module outside bundle root");
            return Err(anyhow!(
                "Access denied: '{}' is outside the bundle root",
                path.display()
            ));
        }
        if !matches!(
            canonical.extension().and_then(|e| e.to_str()),
            Some("js") | Some("mjs")
        ) {
            return Err(anyhow!(
                "Only .js and .mjs modules can be loaded, got: {}",
                path.display()
            ));
        }
        Ok(canonical)
    }

    fn to_specifier(&self, specifier: &str, referrer: &str) -> Result<ModuleSpecifier, Error> {
        if let Some(scheme) = FORBIDDEN_SCHEMES.iter().find(|s| specifier.starts_with(**s)) {
            return Err(anyhow!(
                "Imports with '{}' are forbidden in the sandbox: {}",
                scheme,
                specifier
            ));
        }

        if specifier.starts_with("./") || specifier.starts_with("../") {
            let base = ModuleSpecifier::parse(referrer)
                .map_err(|e| anyhow!("Invalid referrer '{}': {}", referrer, e))?;
            return base
                .join(specifier)
                .map_err(|e| anyhow!("Failed to resolve '{}': {}", specifier, e));
        }
        if specifier.starts_with("file://") {
            return ModuleSpecifier::parse(specifier)
                .map_err(|e| anyhow!("Invalid file URL '{}': {}", specifier, e));
        }
        // Absolute paths as well as bare names ("chunk-abc123.js") are taken
        // relative to the bundle root.
        let relative = specifier.trim_start_matches('/');
        ModuleSpecifier::from_file_path(self.root.join(relative))
            .map_err(|_| anyhow!("Invalid module specifier: {}", specifier))
    }
}

impl ModuleLoader for SandboxedLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        let resolved = self.to_specifier(specifier, referrer)?;
        if resolved.scheme() != "file" {
            return Err(anyhow!("Only file:// modules allowed, got: {}", resolved));
        }
        let path = resolved
            .to_file_path()
            .map_err(|_| anyhow!("Failed to convert URL to path: {}", resolved))?;
        let canonical = self.admit(&path)?;
        ModuleSpecifier::from_file_path(&canonical)
            .map_err(|_| anyhow!("Invalid module path: {}", canonical.display()))
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let load = || -> Result<ModuleSource, Error> {
            let path = module_specifier
                .to_file_path()
                .map_err(|_| anyhow!("Invalid file path: {}", module_specifier))?;
            // Checked again: resolve() is not the only way to reach load().
            let path = self.admit(&path)?;
            let code = std::fs::read_to_string(&path)
                .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
            Ok(ModuleSource::new(
                ModuleType::JavaScript,
                ModuleSourceCode::String(code.into()),
                module_specifier,
                None,
            ))
        };
        ModuleLoadResponse::Sync(load())
    }
}
