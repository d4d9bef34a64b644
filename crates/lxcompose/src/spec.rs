//! lxc-compose configuration parsing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use lxcompose_common::{ContainerName, LxcError};
use lxcompose_net::{ForwardRequest, Protocol};
use miette::Diagnostic;
use serde::Deserialize;

/// Image used when a container does not name one.
pub const DEFAULT_IMAGE: &str = "ubuntu:24.04";

/// A validated compose file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeFile {
    /// Containers, ordered by name.
    pub containers: Vec<ContainerSpec>,
}

/// One container of a compose file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: ContainerName,
    /// Image to launch.
    pub image: String,
    /// Ports reachable from outside the container subnet.
    pub exposed_ports: Vec<u16>,
    /// Host ports forwarded into the container.
    pub port_forwards: Vec<PortSpec>,
    /// Containers that must be up first.
    pub depends_on: Vec<String>,
}

impl ContainerSpec {
    /// Forward requests targeting this container.
    #[must_use]
    pub fn forwards(&self) -> Vec<ForwardRequest> {
        self.port_forwards
            .iter()
            .map(|spec| spec.to_request(self.name.as_str()))
            .collect()
    }
}

/// A parsed port forward declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Host port.
    pub host: u16,
    /// Container port.
    pub container: u16,
    /// Protocol.
    pub protocol: Protocol,
    /// Free-form description.
    pub description: Option<String>,
}

impl PortSpec {
    /// Request forwarding this port into `container`.
    #[must_use]
    pub fn to_request(&self, container: &str) -> ForwardRequest {
        ForwardRequest {
            host_port: self.host,
            container: container.to_string(),
            container_port: self.container,
            protocol: self.protocol,
            description: self.description.clone(),
        }
    }

    /// Parse `8080`, `8080:80` or `8080:80/udp`.
    ///
    /// # Errors
    ///
    /// Returns [`LxcError::InvalidPortSpec`] for malformed ports or
    /// unknown protocols.
    pub fn parse(value: &str) -> Result<Self, LxcError> {
        let value = value.trim();
        let (ports, protocol) = match value.split_once('/') {
            Some((ports, protocol)) => (ports, protocol.parse()?),
            None => (value, Protocol::Tcp),
        };

        let (host, container) = match ports.split_once(':') {
            Some((host, container)) => (parse_port(host)?, parse_port(container)?),
            None => {
                let port = parse_port(ports)?;
                (port, port)
            }
        };

        Ok(Self {
            host,
            container,
            protocol,
            description: None,
        })
    }
}

fn parse_port(value: &str) -> Result<u16, LxcError> {
    let invalid = || LxcError::InvalidPortSpec {
        value: value.to_string(),
    };
    let port: i64 = value.trim().parse().map_err(|_| invalid())?;
    check_port(port).ok_or_else(invalid)
}

fn check_port(port: i64) -> Option<u16> {
    u16::try_from(port).ok().filter(|&p| p != 0)
}

/// Errors raised while loading a compose file.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum ComposeFileError {
    /// I/O error.
    #[error("Failed to read {path}: {source}")]
    #[diagnostic(code(lxcompose::config::read))]
    Io {
        /// File that could not be read.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Parse error.
    #[error("Failed to parse compose file: {0}")]
    #[diagnostic(code(lxcompose::config::parse))]
    Parse(#[from] serde_yaml::Error),
    /// Structurally valid YAML with invalid content.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Invalid(#[from] LxcError),
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    containers: RawContainers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContainers {
    Map(BTreeMap<String, RawContainer>),
    List(Vec<RawContainer>),
}

impl Default for RawContainers {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawContainer {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    exposed_ports: RawPorts,
    #[serde(default)]
    port_forwards: Vec<RawPortSpec>,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPorts {
    Single(i64),
    List(Vec<i64>),
}

impl Default for RawPorts {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPortSpec {
    SinglePort(i64),
    Mapping(String),
    FullSpec {
        host: i64,
        container: i64,
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
}

impl TryFrom<RawPortSpec> for PortSpec {
    type Error = LxcError;

    fn try_from(raw: RawPortSpec) -> Result<Self, Self::Error> {
        match raw {
            RawPortSpec::SinglePort(port) => {
                let port = check_port(port).ok_or_else(|| LxcError::InvalidPortSpec {
                    value: port.to_string(),
                })?;
                Ok(Self {
                    host: port,
                    container: port,
                    protocol: Protocol::Tcp,
                    description: None,
                })
            }
            RawPortSpec::Mapping(value) => Self::parse(&value),
            RawPortSpec::FullSpec {
                host,
                container,
                protocol,
                description,
            } => {
                let invalid = || LxcError::InvalidPortSpec {
                    value: format!("{host}:{container}"),
                };
                Ok(Self {
                    host: check_port(host).ok_or_else(invalid)?,
                    container: check_port(container).ok_or_else(invalid)?,
                    protocol: protocol.as_deref().map_or(Ok(Protocol::Tcp), str::parse::<Protocol>)?,
                    description,
                })
            }
        }
    }
}

impl RawContainer {
    fn validate(self, name: String) -> Result<ContainerSpec, LxcError> {
        let name = ContainerName::new(name)?;

        let exposed = match self.exposed_ports {
            RawPorts::Single(port) => vec![port],
            RawPorts::List(ports) => ports,
        };
        let exposed_ports = exposed
            .into_iter()
            .map(|port| {
                check_port(port).ok_or_else(|| LxcError::InvalidPortSpec {
                    value: port.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let port_forwards = self
            .port_forwards
            .into_iter()
            .map(PortSpec::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ContainerSpec {
            name,
            image: self.image.unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            exposed_ports,
            port_forwards,
            depends_on: self.depends_on,
        })
    }
}

impl ComposeFile {
    /// Parse and validate YAML.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed YAML, invalid names or ports, duplicate
    /// names, or unknown dependencies.
    pub fn from_yaml(yaml: &str) -> Result<Self, ComposeFileError> {
        let raw: RawFile = serde_yaml::from_str(yaml)?;

        let named: Vec<(String, RawContainer)> = match raw.containers {
            RawContainers::Map(map) => map.into_iter().collect(),
            RawContainers::List(list) => list
                .into_iter()
                .map(|c| {
                    let name = c.name.clone().ok_or_else(|| LxcError::Config {
                        message: "container entry without a name".to_string(),
                    })?;
                    Ok((name, c))
                })
                .collect::<Result<Vec<_>, LxcError>>()?,
        };

        let mut seen = BTreeSet::new();
        let mut containers = Vec::with_capacity(named.len());
        for (name, raw) in named {
            if !seen.insert(name.clone()) {
                return Err(LxcError::Config {
                    message: format!("container '{name}' is declared twice"),
                }
                .into());
            }
            containers.push(raw.validate(name)?);
        }
        containers.sort_by(|a, b| a.name.cmp(&b.name));

        let file = Self { containers };
        file.dependency_order()?;
        Ok(file)
    }

    /// Parse from file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn from_file(path: &Path) -> Result<Self, ComposeFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| ComposeFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Look up a container by name.
    #[must_use]
    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name.as_str() == name)
    }

    /// Names of all containers.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.containers.iter().map(|c| c.name.as_str())
    }

    /// Containers with every dependency before its dependents (topological sort).
    ///
    /// Ties are broken alphabetically.
    ///
    /// # Errors
    ///
    /// Returns [`LxcError::Config`] for unknown dependencies or cycles.
    pub fn dependency_order(&self) -> Result<Vec<&ContainerSpec>, LxcError> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();

        for container in &self.containers {
            in_degree.insert(container.name.as_str(), 0);
        }

        for container in &self.containers {
            let name = container.name.as_str();
            for dep in &container.depends_on {
                if !in_degree.contains_key(dep.as_str()) {
                    return Err(LxcError::Config {
                        message: format!("Container '{name}' depends on unknown container '{dep}'"),
                    });
                }
                dependents.entry(dep.as_str()).or_default().push(name);
                *in_degree.entry(name).or_default() += 1;
            }
        }

        // Kahn's algorithm; the ready set stays sorted
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.containers.len());

        while let Some(name) = ready.pop_first() {
            if let Some(container) = self.container(name) {
                order.push(container);
            }
            for &next in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if order.len() != self.containers.len() {
            return Err(LxcError::Config {
                message: "Circular dependency detected between containers".to_string(),
            });
        }
        Ok(order)
    }
}
