//! Programmatic config creation with builder pattern

use stagehand_launcher::config::{LauncherConfig, ProvisionSpec, ServiceSpec, ToolchainSpec};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Builder for creating launcher configurations
pub struct TestConfigBuilder {
    services: BTreeMap<String, ServiceSpec>,
    toolchains: Vec<ToolchainSpec>,
    state_dir: Option<PathBuf>,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            services: BTreeMap::new(),
            toolchains: Vec::new(),
            state_dir: None,
        }
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = Some(dir);
        self
    }

    pub fn add_toolchain(mut self, toolchain: ToolchainSpec) -> Self {
        self.toolchains.push(toolchain);
        self
    }

    pub fn add_service(mut self, name: &str, service: ServiceSpec) -> Self {
        self.services.insert(name.to_string(), service);
        self
    }

    pub fn build(self) -> LauncherConfig {
        LauncherConfig {
            services: self.services,
            toolchains: self.toolchains,
            known_bad_pins: Vec::new(),
            expected_files: Vec::new(),
            state_dir: self.state_dir,
        }
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating service specs
pub struct TestServiceBuilder {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    ports: Vec<u16>,
    health_url: String,
    health_timeout: Duration,
    env: HashMap<String, String>,
    provision: Option<ProvisionSpec>,
}

impl TestServiceBuilder {
    pub fn new(command: Vec<&str>) -> Self {
        Self {
            command: command.into_iter().map(String::from).collect(),
            working_dir: None,
            ports: vec![8080],
            health_url: "http://127.0.0.1:{port}/health".to_string(),
            health_timeout: Duration::from_secs(10),
            env: HashMap::new(),
            provision: None,
        }
    }

    /// Convenience for `sh -c <script>` services.
    pub fn shell(script: &str) -> Self {
        Self::new(vec!["sh", "-c", script])
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_health_url(mut self, url: &str) -> Self {
        self.health_url = url.to_string();
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_provision(mut self, provision: ProvisionSpec) -> Self {
        self.provision = Some(provision);
        self
    }

    pub fn build(self) -> ServiceSpec {
        ServiceSpec {
            command: self.command,
            working_dir: self.working_dir,
            ports: self.ports,
            health_url: self.health_url,
            health_timeout: self.health_timeout,
            env: self.env,
            manifest: None,
            provision: self.provision,
            open_browser: false,
        }
    }
}
