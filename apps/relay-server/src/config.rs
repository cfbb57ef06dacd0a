//! Command-line configuration.

use clap::Parser;

use meshrelay_hub::HubConfig;
use meshrelay_protocol::constants::DEFAULT_HUB_PORT;

/// Local broadcast relay for mesh agents. No auth, no TLS: run it on a
/// trusted network only.
#[derive(Debug, Parser)]
#[command(name = "meshrelay-server", version)]
pub struct Args {
    /// Port to listen on (all interfaces).
    #[arg(default_value_t = DEFAULT_HUB_PORT)]
    pub port: u16,
}

impl Args {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            port: self.port,
            ..HubConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_protocol::constants::HUB_STATUS_INTERVAL;

    #[test]
    fn port_defaults() {
        let args = Args::try_parse_from(["meshrelay-server"]).unwrap();
        assert_eq!(args.port, 8765);
        assert_eq!(args.hub_config().status_interval, HUB_STATUS_INTERVAL);
    }

    #[test]
    fn positional_port() {
        let args = Args::try_parse_from(["meshrelay-server", "9000"]).unwrap();
        assert_eq!(args.hub_config().port, 9000);
    }

    #[test]
    fn rejects_bad_port() {
        assert!(Args::try_parse_from(["meshrelay-server", "http"]).is_err());
        assert!(Args::try_parse_from(["meshrelay-server", "70000"]).is_err());
        assert!(Args::try_parse_from(["meshrelay-server", "--verbose"]).is_err());
    }
}
