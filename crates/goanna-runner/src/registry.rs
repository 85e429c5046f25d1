use goanna_runner_core::{RunnerError, SettingError, read_setting};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Prefix that marks a `bin` argument as a device rather than a host path
pub const DEVICE_PREFIX: &str = "device:";

static STANDARD: LazyLock<Arc<VariantRegistry>> = LazyLock::new(|| {
    Arc::new(
        VariantRegistry::builder()
            .register("desktop", RunnerKind::LocalProcess)
            .register("device", RunnerKind::Device)
            .register("mobile-app", RunnerKind::MobileApp)
            .register("fennec", RunnerKind::MobileApp)
            .alias_product("Pale Moon", "desktop")
            .alias_product("Basilisk", "desktop")
            .alias_product("Firefox", "desktop")
            .alias_product("Fennec", "fennec")
            .build(),
    )
});

/// The closed set of runner variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerKind {
    /// A browser process on this host
    LocalProcess,
    /// A browser already installed on an attached device
    Device,
    /// A device browser installed from a package archive for the run
    MobileApp,
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerKind::LocalProcess => write!(f, "local process"),
            RunnerKind::Device => write!(f, "device"),
            RunnerKind::MobileApp => write!(f, "mobile app"),
        }
    }
}

/// What the `bin` argument points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Binary(PathBuf),
    /// A device serial; empty means the only attached device
    Device(String),
}

impl Target {
    pub fn parse(bin: &str) -> Self {
        match bin.strip_prefix(DEVICE_PREFIX) {
            Some(serial) => Target::Device(serial.trim().to_string()),
            None => Target::Binary(PathBuf::from(bin)),
        }
    }

    pub fn serial(&self) -> Option<&str> {
        match self {
            Target::Device(serial) if !serial.is_empty() => Some(serial),
            _ => None,
        }
    }
}

/// Immutable map from application identifiers to runner variants.
///
/// Built once and shared; lookups never mutate it, so one registry can serve
/// any number of factories concurrently.
#[derive(Debug, Clone, Default)]
pub struct VariantRegistry {
    variants: HashMap<String, RunnerKind>,
    /// Product names from `application.ini` mapped to registered app ids
    products: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct VariantRegistryBuilder {
    registry: VariantRegistry,
}

impl VariantRegistryBuilder {
    pub fn register(mut self, app: impl Into<String>, kind: RunnerKind) -> Self {
        self.registry.variants.insert(app.into(), kind);
        self
    }

    pub fn alias_product(mut self, product: impl Into<String>, app: impl Into<String>) -> Self {
        self.registry.products.insert(product.into(), app.into());
        self
    }

    pub fn build(self) -> VariantRegistry {
        self.registry
    }
}

impl VariantRegistry {
    pub fn builder() -> VariantRegistryBuilder {
        VariantRegistryBuilder::default()
    }

    /// The registry every factory uses unless given another one
    pub fn standard() -> Arc<VariantRegistry> {
        STANDARD.clone()
    }

    pub fn lookup(&self, app: &str) -> Option<RunnerKind> {
        self.variants.get(app).copied()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Registered app id for a product name
    pub fn app_for_product(&self, product: &str) -> Option<&str> {
        self.products.get(product).map(String::as_str)
    }

    /// Work out the app id and variant by probing the binary's `application.ini`.
    ///
    /// Anything short of a registered product name is `UnsupportedTarget`.
    pub fn infer(&self, binary: &Path) -> Result<(String, RunnerKind), RunnerError> {
        let unsupported = || RunnerError::unsupported(None, Some(&binary.display().to_string()));

        let product = product_name(binary).ok_or_else(unsupported)?;
        let app = self.app_for_product(&product).ok_or_else(|| {
            debug!(%product, "Product has no registered runner");
            unsupported()
        })?;
        let kind = self.lookup(app).ok_or_else(unsupported)?;
        debug!(binary = %binary.display(), %product, app, %kind, "Inferred runner variant");
        Ok((app.to_string(), kind))
    }
}

/// `[App] Name` from the `application.ini` shipped next to a binary
fn product_name(binary: &Path) -> Option<String> {
    let dir = binary.parent()?;
    let candidates = [
        dir.join("application.ini"),
        // bundle layout: Contents/MacOS/<bin> next to Contents/Resources
        dir.join("..").join("Resources").join("application.ini"),
    ];

    for ini in candidates.iter().filter(|p| p.is_file()) {
        match read_setting(ini, "App", "Name") {
            Ok(Some(name)) => return Some(name),
            Ok(None) => {}
            Err(SettingError::Io(e)) => debug!(path = %ini.display(), error = %e, "Unreadable application.ini"),
            Err(e) => debug!(path = %ini.display(), error = %e, "No product name"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_install(product: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("application.ini"),
            format!("[App]\nVendor=Example\nName={product}\nVersion=1.0\n"),
        )
        .unwrap();
        let bin = dir.path().join("browser");
        fs::write(&bin, b"").unwrap();
        (dir, bin)
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(
            Target::parse("device:emulator-5554"),
            Target::Device("emulator-5554".to_string())
        );
        assert_eq!(Target::parse("device:").serial(), None);
        assert_eq!(
            Target::parse("/opt/palemoon/palemoon"),
            Target::Binary(PathBuf::from("/opt/palemoon/palemoon"))
        );
    }

    #[test]
    fn test_standard_registry() {
        let registry = VariantRegistry::standard();
        assert_eq!(registry.lookup("desktop"), Some(RunnerKind::LocalProcess));
        assert_eq!(registry.lookup("mobile-app"), Some(RunnerKind::MobileApp));
        assert_eq!(registry.lookup("device"), Some(RunnerKind::Device));
        assert_eq!(registry.lookup("phantom"), None);
        assert!(Arc::ptr_eq(&registry, &VariantRegistry::standard()));
    }

    #[test]
    fn test_infer_from_application_ini() {
        let registry = VariantRegistry::standard();
        let (_dir, bin) = fake_install("Pale Moon");
        let (app, kind) = registry.infer(&bin).unwrap();
        assert_eq!(app, "desktop");
        assert_eq!(kind, RunnerKind::LocalProcess);

        let (_dir, bin) = fake_install("Fennec");
        assert_eq!(registry.infer(&bin).unwrap().1, RunnerKind::MobileApp);
    }

    #[test]
    fn test_infer_bundle_layout() {
        let root = tempfile::tempdir().unwrap();
        let macos = root.path().join("Contents").join("MacOS");
        let resources = root.path().join("Contents").join("Resources");
        fs::create_dir_all(&macos).unwrap();
        fs::create_dir_all(&resources).unwrap();
        fs::write(resources.join("application.ini"), "[App]\nName=Basilisk\n").unwrap();

        let (app, _) = VariantRegistry::standard().infer(&macos.join("basilisk")).unwrap();
        assert_eq!(app, "desktop");
    }

    #[test]
    fn test_infer_failures_are_unsupported() {
        let registry = VariantRegistry::standard();

        let (_dir, bin) = fake_install("Thunderbird");
        assert!(matches!(registry.infer(&bin), Err(RunnerError::UnsupportedTarget { .. })));

        let empty = tempfile::tempdir().unwrap();
        let bin = empty.path().join("browser");
        assert!(matches!(registry.infer(&bin), Err(RunnerError::UnsupportedTarget { .. })));
    }

    #[test]
    fn test_custom_registry() {
        let registry = VariantRegistry::builder()
            .register("desktop", RunnerKind::LocalProcess)
            .build();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("mobile-app"), None);
        assert_eq!(registry.app_for_product("Pale Moon"), None);
    }
}
