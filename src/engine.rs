use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{ArgError, Command};

// No shell strings anywhere in here. Every user supplied value becomes exactly
// one argument of the engine command.

/// An image reference in the "name:tag" form, such as "myapp:latest" or
/// "registry.example.com/team/app:1.2"
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    /// Validates the parts. An empty `tag` becomes "latest".
    pub fn new(name: impl AsRef<str>, tag: impl AsRef<str>) -> Result<Self, ArgError> {
        let name = name.as_ref().trim();
        let tag = tag.as_ref().trim();
        if name.is_empty() || name.starts_with('-') || name.contains(char::is_whitespace) {
            return Err(ArgError::ImageRef(name.to_owned()))
        }
        if tag.contains(char::is_whitespace) || tag.contains(':') {
            return Err(ArgError::ImageRef(format!("{name}:{tag}")))
        }
        Ok(Self {
            name: name.to_owned(),
            tag: if tag.is_empty() { "latest" } else { tag }.to_owned(),
        })
    }
}

impl FromStr for ImageRef {
    type Err = ArgError;

    /// Splits on the last ':' that comes after the last '/', so registry ports
    /// such as "localhost:5000/app" are not mistaken for tags
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        match s[name_start..].rfind(':') {
            Some(i) => Self::new(&s[..name_start + i], &s[name_start + i + 1..]),
            None => Self::new(s, ""),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// A `-p` argument of the form `[IP:]HOST:CONTAINER[/PROTO]`
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping(String);

impl FromStr for PortMapping {
    type Err = ArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ArgError::PortMapping(s.to_owned());
        let (ports, proto) = match s.split_once('/') {
            Some((ports, proto)) => (ports, Some(proto)),
            None => (s, None),
        };
        if let Some(proto) = proto {
            if !matches!(proto, "tcp" | "udp" | "sctp") {
                return Err(err())
            }
        }
        let mut parts = ports.rsplitn(3, ':');
        let container = parts.next().ok_or_else(err)?;
        let host = parts.next().ok_or_else(err)?;
        // the IP part may be an IPv6 address in brackets which contains ':'
        let ip = parts.next();
        let is_port = |p: &str| !p.is_empty() && p.parse::<u16>().is_ok();
        let is_port_or_range = |p: &str| match p.split_once('-') {
            Some((a, b)) => is_port(a) && is_port(b),
            None => is_port(p),
        };
        if !is_port_or_range(container) || !is_port_or_range(host) {
            return Err(err())
        }
        if let Some(ip) = ip {
            if ip.is_empty() || ip.contains(char::is_whitespace) {
                return Err(err())
            }
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PortMapping {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which `--format` template the inventory listings ask the engine for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryFormat {
    /// `{{json .}}`, one JSON object per line
    #[default]
    Json,
    /// Tab separated fields in a fixed order, for engines without the `json`
    /// template function
    Tabs,
}

pub const IMAGE_TABS_TEMPLATE: &str = "{{.Repository}}\t{{.Tag}}\t{{.ID}}\t{{.Size}}";
pub const CONTAINER_TABS_TEMPLATE: &str =
    "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}\t{{.Ports}}";
const JSON_TEMPLATE: &str = "{{json .}}";
/// Ends option parsing of the engine CLI, everything after it is positional
const END_OF_OPTIONS: &str = "--";

/// Builds argument vector [Command]s for a docker compatible CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engine {
    /// The CLI binary, "docker" by default
    pub program: String,
    pub format: InventoryFormat,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl Engine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            format: InventoryFormat::default(),
        }
    }

    pub fn format(mut self, format: InventoryFormat) -> Self {
        self.format = format;
        self
    }

    fn command(&self) -> Command {
        Command::new_os_str(&self.program)
    }

    /// `<engine> --version`, used for checking that the engine is installed
    pub fn version(&self) -> Command {
        self.command().arg("--version")
    }

    pub fn list_images(&self) -> Command {
        let template = match self.format {
            InventoryFormat::Json => JSON_TEMPLATE,
            InventoryFormat::Tabs => IMAGE_TABS_TEMPLATE,
        };
        self.command().args(["images", "--format", template])
    }

    pub fn list_containers(&self) -> Command {
        let template = match self.format {
            InventoryFormat::Json => JSON_TEMPLATE,
            InventoryFormat::Tabs => CONTAINER_TABS_TEMPLATE,
        };
        self.command().args(["ps", "-a", "--format", template])
    }

    /// `<engine> build -t <image> -- <context_dir>`
    pub fn build(&self, image: &ImageRef, context_dir: impl AsRef<Path>) -> Command {
        self.command()
            .args(["build", "-t"])
            .arg(image.to_string())
            .arg(END_OF_OPTIONS)
            .arg(context_dir.as_ref())
    }

    /// `<engine> run -d -p <ports> --name=<container> -- <image>`
    pub fn run(&self, image: &ImageRef, container: &str, ports: Option<&PortMapping>) -> Command {
        let mut command = self.command().args(["run", "-d"]);
        if let Some(ports) = ports {
            command = command.arg("-p").arg(ports.to_string());
        }
        // the `=` form keeps a name such as "-it" from being read as flags
        command
            .arg(format!("--name={container}"))
            .arg(END_OF_OPTIONS)
            .arg(image.to_string())
    }

    pub fn push(&self, image: &ImageRef) -> Command {
        self.positional("push", [image.to_string()])
    }

    pub fn pull(&self, image: &ImageRef) -> Command {
        self.positional("pull", [image.to_string()])
    }

    pub fn stop(&self, container: &str) -> Command {
        self.positional("stop", [container])
    }

    /// `<engine> commit -- <container> <image>`
    pub fn commit(&self, container: &str, image: &ImageRef) -> Command {
        self.positional("commit", [container.to_owned(), image.to_string()])
    }

    /// `<engine> rmi -f -- <id>`
    pub fn remove_image(&self, id: &str) -> Command {
        self.command()
            .args(["rmi", "-f", END_OF_OPTIONS])
            .arg(id)
    }

    pub fn search(&self, term: &str) -> Command {
        self.positional("search", [term])
    }

    pub fn logs(&self, container: &str) -> Command {
        self.positional("logs", [container])
    }

    /// `<engine> <verb> -- <values..>`, so that a value starting with '-' is
    /// never taken for an option
    fn positional<I, S>(&self, verb: &str, values: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.command().args([verb, END_OF_OPTIONS]).args(values)
    }
}
