use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tradewire_net::DEFAULT_RELAY_PORT;

pub struct RelayConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl RelayConfig {
    pub fn new(bind: Option<IpAddr>, port: Option<u16>, data_dir: Option<String>) -> Self {
        let bind = bind.unwrap_or_else(|| "0.0.0.0".parse().unwrap());
        let port = port.unwrap_or(DEFAULT_RELAY_PORT);

        let data_dir = data_dir.map(PathBuf::from).unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "tradewire", "tradewire-relayd")
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".tradewire"))
        });

        Self {
            bind,
            port,
            data_dir,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}
