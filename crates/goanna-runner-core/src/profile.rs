use crate::error::RunnerError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Paths currently held by a live profile context in this process
static LIVE_PROFILES: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// A single preference value as written to `user.js`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl PrefValue {
    fn to_js(&self) -> String {
        match self {
            PrefValue::Bool(b) => b.to_string(),
            PrefValue::Int(i) => i.to_string(),
            // JSON string escaping is valid JS string escaping
            PrefValue::String(s) => serde_json::Value::String(s.clone()).to_string(),
        }
    }
}

impl From<bool> for PrefValue {
    fn from(value: bool) -> Self {
        PrefValue::Bool(value)
    }
}

impl From<i64> for PrefValue {
    fn from(value: i64) -> Self {
        PrefValue::Int(value)
    }
}

impl From<&str> for PrefValue {
    fn from(value: &str) -> Self {
        PrefValue::String(value.to_string())
    }
}

impl From<String> for PrefValue {
    fn from(value: String) -> Self {
        PrefValue::String(value)
    }
}

/// How the profile for a run is obtained
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileOptions {
    /// Existing profile directory to run with instead of a fresh one
    #[serde(default)]
    pub reuse: Option<PathBuf>,

    #[serde(default)]
    pub preferences: BTreeMap<String, PrefValue>,

    /// Extension packages copied into `<profile>/extensions/`
    #[serde(default)]
    pub extensions: Vec<PathBuf>,

    /// Keep a fresh profile on disk after the run
    #[serde(default)]
    pub retain: bool,
}

impl ProfileOptions {
    pub fn preference(mut self, name: impl Into<String>, value: impl Into<PrefValue>) -> Self {
        self.preferences.insert(name.into(), value.into());
        self
    }
}

/// The isolated working area one browser instance runs with
#[derive(Debug)]
pub struct ProfileContext {
    path: PathBuf,
    /// Canonical form of `path`, the key in the live profile registry
    key: PathBuf,
    temp: Option<TempDir>,
    preferences: BTreeMap<String, PrefValue>,
    extensions: Vec<PathBuf>,
    retain: bool,
    released: bool,
}

impl ProfileContext {
    /// Create a fresh profile, or claim the reuse path from `options`
    pub fn acquire(options: &ProfileOptions) -> Result<Self, RunnerError> {
        let (path, temp) = match &options.reuse {
            Some(path) => {
                fs::create_dir_all(path).map_err(|e| {
                    RunnerError::ProfileError(format!(
                        "Cannot create profile directory {}: {e}",
                        path.display()
                    ))
                })?;
                (path.clone(), None)
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("goanna-profile-")
                    .tempdir()
                    .map_err(|e| {
                        RunnerError::ProfileError(format!("Cannot create temporary profile: {e}"))
                    })?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        let key = fs::canonicalize(&path).map_err(|e| {
            RunnerError::ProfileError(format!("Cannot resolve profile {}: {e}", path.display()))
        })?;
        claim(&key)?;

        // from here on Drop releases the claim
        let mut context = Self {
            path,
            key,
            temp,
            preferences: BTreeMap::new(),
            extensions: Vec::new(),
            retain: options.retain,
            released: false,
        };

        context.write_preferences(&options.preferences)?;
        for extension in &options.extensions {
            context.install_extension(extension)?;
        }

        info!(
            path = %context.path.display(),
            fresh = context.is_owned(),
            preferences = context.preferences.len(),
            extensions = context.extensions.len(),
            "Acquired profile"
        );
        Ok(context)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn preferences(&self) -> &BTreeMap<String, PrefValue> {
        &self.preferences
    }

    /// Installed extension paths inside the profile
    pub fn extensions(&self) -> &[PathBuf] {
        &self.extensions
    }

    /// True when the directory was created for this context and is removed on release
    pub fn is_owned(&self) -> bool {
        self.temp.is_some()
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn set_retain(&mut self, retain: bool) {
        self.retain = retain;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Give the profile back. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        unclaim(&self.key);

        match self.temp.take() {
            Some(dir) if self.retain => {
                let kept = dir.keep();
                info!(path = %kept.display(), "Retained profile");
            }
            Some(dir) => {
                if let Err(e) = dir.close() {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove profile");
                } else {
                    debug!(path = %self.path.display(), "Removed profile");
                }
            }
            None => debug!(path = %self.path.display(), "Released reused profile"),
        }
    }

    fn write_preferences(&mut self, preferences: &BTreeMap<String, PrefValue>) -> Result<(), RunnerError> {
        if preferences.is_empty() {
            return Ok(());
        }
        let mut contents = String::new();
        for (name, value) in preferences {
            let name = serde_json::Value::String(name.clone()).to_string();
            contents.push_str(&format!("user_pref({name}, {});\n", value.to_js()));
        }
        let user_js = self.path.join("user.js");
        fs::write(&user_js, contents).map_err(|e| {
            RunnerError::ProfileError(format!("Cannot write {}: {e}", user_js.display()))
        })?;
        self.preferences.extend(preferences.clone());
        Ok(())
    }

    fn install_extension(&mut self, source: &Path) -> Result<(), RunnerError> {
        let name = source.file_name().ok_or_else(|| {
            RunnerError::ProfileError(format!("Invalid extension path {}", source.display()))
        })?;
        let target = self.path.join("extensions").join(name);
        copy_recursive(source, &target).map_err(|e| {
            RunnerError::ProfileError(format!(
                "Cannot install extension {}: {e}",
                source.display()
            ))
        })?;
        debug!(extension = %target.display(), "Installed extension");
        self.extensions.push(target);
        Ok(())
    }
}

impl Drop for ProfileContext {
    fn drop(&mut self) {
        self.release();
    }
}

fn claim(path: &Path) -> Result<(), RunnerError> {
    let mut live = LIVE_PROFILES
        .lock()
        .map_err(|_| RunnerError::ProfileError("profile registry poisoned".to_string()))?;
    if !live.insert(path.to_path_buf()) {
        return Err(RunnerError::ProfileError(format!(
            "Profile {} is already in use by another runner",
            path.display()
        )));
    }
    Ok(())
}

fn unclaim(path: &Path) {
    if let Ok(mut live) = LIVE_PROFILES.lock() {
        live.remove(path);
    }
}

fn copy_recursive(source: &Path, target: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        fs::create_dir_all(target)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_profiles_are_isolated() {
        let first = ProfileContext::acquire(&ProfileOptions::default()).unwrap();
        let second = ProfileContext::acquire(&ProfileOptions::default()).unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().is_dir());
        assert!(first.is_owned());
    }

    #[test]
    fn test_release_is_idempotent_and_removes_fresh_profile() {
        let mut profile = ProfileContext::acquire(&ProfileOptions::default()).unwrap();
        let path = profile.path().to_path_buf();

        profile.release();
        assert!(profile.is_released());
        assert!(!path.exists());

        profile.release();
        assert!(profile.is_released());
    }

    #[test]
    fn test_retained_profile_survives_release() {
        let options = ProfileOptions {
            retain: true,
            ..Default::default()
        };
        let mut profile = ProfileContext::acquire(&options).unwrap();
        let path = profile.path().to_path_buf();
        profile.release();
        assert!(path.is_dir());
        fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn test_reused_profile_is_exclusive_and_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let options = ProfileOptions {
            reuse: Some(dir.path().join("profile")),
            ..Default::default()
        };

        let mut first = ProfileContext::acquire(&options).unwrap();
        assert!(!first.is_owned());

        let second = ProfileContext::acquire(&options);
        assert!(matches!(second, Err(RunnerError::ProfileError(_))));

        first.release();
        assert!(dir.path().join("profile").is_dir());

        // released paths can be claimed again
        let again = ProfileContext::acquire(&options).unwrap();
        assert_eq!(again.path(), dir.path().join("profile"));
    }

    #[test]
    fn test_reuse_claim_sees_through_path_aliases() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("x")).unwrap();
        let direct = ProfileOptions {
            reuse: Some(dir.path().join("p")),
            ..Default::default()
        };
        let dotted = ProfileOptions {
            reuse: Some(dir.path().join("x").join("..").join("p")),
            ..Default::default()
        };

        let mut first = ProfileContext::acquire(&direct).unwrap();
        let second = ProfileContext::acquire(&dotted);
        assert!(matches!(second, Err(RunnerError::ProfileError(_))));

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(dir.path().join("p"), dir.path().join("link")).unwrap();
            let linked = ProfileOptions {
                reuse: Some(dir.path().join("link")),
                ..Default::default()
            };
            assert!(ProfileContext::acquire(&linked).is_err());
        }

        first.release();
        assert!(ProfileContext::acquire(&dotted).is_ok());
    }

    #[test]
    fn test_preferences_written_to_user_js() {
        let options = ProfileOptions::default()
            .preference("browser.shell.checkDefaultBrowser", false)
            .preference("dom.max_script_run_time", 0i64)
            .preference("browser.startup.homepage", "about:\"blank\"");
        let profile = ProfileContext::acquire(&options).unwrap();

        let user_js = fs::read_to_string(profile.path().join("user.js")).unwrap();
        assert!(user_js.contains("user_pref(\"browser.shell.checkDefaultBrowser\", false);"));
        assert!(user_js.contains("user_pref(\"dom.max_script_run_time\", 0);"));
        assert!(user_js.contains("user_pref(\"browser.startup.homepage\", \"about:\\\"blank\\\"\");"));
        assert_eq!(profile.preferences().len(), 3);
    }

    #[test]
    fn test_extensions_copied_into_profile() {
        let source = tempfile::tempdir().unwrap();
        let xpi = source.path().join("helper@example.org.xpi");
        fs::write(&xpi, b"PK").unwrap();

        let options = ProfileOptions {
            extensions: vec![xpi],
            ..Default::default()
        };
        let profile = ProfileContext::acquire(&options).unwrap();
        let installed = profile.path().join("extensions").join("helper@example.org.xpi");
        assert!(installed.is_file());
        assert_eq!(profile.extensions(), &[installed]);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: ProfileOptions =
            serde_json::from_str(r#"{"preferences": {"a": true, "b": 2, "c": "x"}}"#).unwrap();
        assert_eq!(options.preferences["a"], PrefValue::Bool(true));
        assert_eq!(options.preferences["b"], PrefValue::Int(2));
        assert_eq!(options.preferences["c"], PrefValue::String("x".to_string()));
        assert!(!options.retain);
        assert!(options.reuse.is_none());
    }
}
