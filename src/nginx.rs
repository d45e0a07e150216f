//! Nginx config generation and reload signalling.
//!
//! Config files are rendered from plain-text templates with `${key}`
//! placeholders. Built-in templates cover the common layout; any of them can
//! be overridden by dropping a file of the same name into
//! `proxy.template_dir`.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::meta::Instance;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const SERVER_TEMPLATE: &str = include_str!("../templates/server.conf");
const LOCATION_TEMPLATE: &str = include_str!("../templates/location.conf");
const DEFAULT_TEMPLATE: &str = include_str!("../templates/default.conf");

/// Substitute `${key}` placeholders with values from `vars`.
///
/// A key present in the template but absent from `vars` is an error; an
/// unterminated `${` is copied through literally.
pub fn render(template: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = &rest[start + 2..start + end];
        let value = vars
            .get(key)
            .ok_or_else(|| Error::ConfigRender { key: key.to_string() })?;
        out.push_str(value);
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// The three templates the configurator renders
#[derive(Debug, Clone)]
pub struct Templates {
    pub server: String,
    pub location: String,
    pub default_route: String,
}

impl Templates {
    /// Load templates, preferring files under `dir` over the built-ins
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        Ok(Self {
            server: load_one(dir, "server.conf", SERVER_TEMPLATE)?,
            location: load_one(dir, "location.conf", LOCATION_TEMPLATE)?,
            default_route: load_one(dir, "default.conf", DEFAULT_TEMPLATE)?,
        })
    }
}

fn load_one(dir: Option<&Path>, name: &str, builtin: &str) -> Result<String> {
    let Some(dir) = dir else {
        return Ok(builtin.to_string());
    };
    let path = dir.join(name);
    if !path.exists() {
        return Ok(builtin.to_string());
    }
    std::fs::read_to_string(&path).map_err(|e| Error::fs(path, e))
}

/// Writes the server, default-route, and per-version location configs and
/// signals nginx to pick them up.
pub struct NginxConfigurator {
    proxy: ProxyConfig,
    templates: Templates,
}

impl NginxConfigurator {
    pub fn new(proxy: ProxyConfig) -> Result<Self> {
        let templates = Templates::load(proxy.template_dir.as_deref())?;
        Ok(Self { proxy, templates })
    }

    /// Path of the server-level config: `<conf_dir>/<name>.conf`
    pub fn server_conf_path(&self) -> PathBuf {
        self.proxy.conf_dir.join(format!("{}.conf", self.proxy.name))
    }

    /// Path of the default-route config: `<conf_dir>/<name>/default.conf`
    pub fn default_conf_path(&self) -> PathBuf {
        self.proxy.conf_dir.join(&self.proxy.name).join("default.conf")
    }

    /// Path of a version's location config: `<app_conf_dir>/v-<name>.conf`
    pub fn location_conf_path(&self, name: &str) -> PathBuf {
        self.proxy.app_conf_dir().join(format!("v-{}.conf", name))
    }

    /// Write the server block. Creates the config directories on first use.
    pub fn write_server_config(&self, default_instance: Option<&str>) -> Result<()> {
        for dir in [
            self.proxy.conf_dir.clone(),
            self.proxy.conf_dir.join(&self.proxy.name),
            self.proxy.app_conf_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| Error::fs(dir.clone(), e))?;
        }

        let vars = BTreeMap::from([
            ("ip", self.proxy.ip.clone()),
            ("port", self.proxy.port.to_string()),
            ("name", self.proxy.name.clone()),
            (
                "defaultInstance",
                default_instance.unwrap_or_default().to_string(),
            ),
        ]);
        let rendered = render(&self.templates.server, &vars)?;

        let path = self.server_conf_path();
        std::fs::write(&path, rendered).map_err(|e| Error::fs(&path, e))?;
        debug!(path = %path.display(), "Wrote nginx server config");
        Ok(())
    }

    /// Write the catch-all route pointing at the pinned current version
    pub fn write_default_config(&self, current_version: &str, instance: &Instance) -> Result<()> {
        let vars = BTreeMap::from([
            ("ip", self.proxy.ip.clone()),
            ("port", instance.port.to_string()),
            ("name", self.proxy.name.clone()),
            ("currentVersion", current_version.to_string()),
        ]);
        let rendered = render(&self.templates.default_route, &vars)?;

        let path = self.default_conf_path();
        std::fs::write(&path, rendered).map_err(|e| Error::fs(&path, e))?;
        debug!(path = %path.display(), current_version, "Wrote nginx default config");
        Ok(())
    }

    /// Write the location block for one version and return its path
    pub fn write_location_config(&self, instance: &Instance) -> Result<PathBuf> {
        let vars = BTreeMap::from([
            ("port", instance.port.to_string()),
            ("name", instance.name.clone()),
        ]);
        let rendered = render(&self.templates.location, &vars)?;

        let path = self.location_conf_path(&instance.name);
        std::fs::write(&path, rendered).map_err(|e| Error::fs(&path, e))?;
        debug!(path = %path.display(), name = %instance.name, "Wrote nginx location config");
        Ok(path)
    }

    /// Remove a retired version's location config. Best effort: the file may
    /// already be gone.
    pub fn remove_location_config(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed nginx location config"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove location config"),
        }
    }

    /// Ask nginx to reload its configuration. Fire-and-forget: the command
    /// runs in the background and failures are logged, never propagated.
    pub fn signal_reload(&self) {
        let command_line = self.proxy.reload_command.clone();
        let argv = match shell_words::split(&command_line) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => {
                warn!("Empty proxy reload command, skipping reload");
                return;
            }
            Err(e) => {
                error!(command = %command_line, error = %e, "Invalid proxy reload command");
                return;
            }
        };

        tokio::spawn(async move {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            match cmd.output().await {
                Ok(output) if output.status.success() => {
                    info!(command = %command_line, "Proxy reloaded");
                }
                Ok(output) => {
                    warn!(
                        command = %command_line,
                        status = ?output.status.code(),
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "Proxy reload command failed"
                    );
                }
                Err(e) => {
                    warn!(
                        command = %command_line,
                        error = %Error::ProxyReload(e),
                        "Could not run proxy reload command"
                    );
                }
            }
        });
    }
}
