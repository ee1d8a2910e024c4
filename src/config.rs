//! Connection parameters, with optional discovery from FreeSWITCH's own
//! `event_socket.conf.xml`.

use std::path::Path;
use std::time::Duration;

use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use tracing::debug;

use crate::constants::*;
use crate::error::{EslError, EslResult};

/// Connection parameters for [`EslClient`](crate::EslClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hostname or IP address of the FreeSWITCH machine.
    pub hostname: String,

    /// Event socket port.
    pub port: u16,

    /// Event socket password.
    pub password: String,

    /// Timeout for dialing, for the connection handshake, and for commands
    /// to be accepted by the session loop.
    pub timeout: Duration,

    /// When `false`, commands interrupted by a disconnection keep waiting
    /// until `timeout` is reached or the client reconnects and accepts
    /// them. When `true`, disconnection fails them immediately, and
    /// commands attempted while disconnected fail with
    /// [`NotConnected`](EslError::NotConnected). Leave it `false` when
    /// running [`connect`](crate::EslClient::connect) in a retry loop.
    pub fail_on_disconnect: bool,

    /// When `true`, only `bgapi` commands are sent to FreeSWITCH and
    /// [`execute`](crate::EslClient::execute) blocks on the job result.
    /// This does not change the client's behaviour, but may affect
    /// FreeSWITCH's scheduling (for better or worse). If in doubt, leave it
    /// `false`.
    pub prevent_socket_blocking: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_ESL_PORT,
            password: DEFAULT_PASSWORD.to_string(),
            timeout: DEFAULT_TIMEOUT,
            fail_on_disconnect: false,
            prevent_socket_blocking: false,
        }
    }
}

impl ClientConfig {
    /// Defaults merged with the event socket configuration at the standard
    /// installation path, when present and readable. Failure to read or
    /// parse the file is not an error; the defaults stand.
    pub fn discover() -> Self {
        let mut config = Self::default();
        if let Err(err) = config.read_conf_file(EVENT_SOCKET_CONF_PATH) {
            debug!(error = %err, "no usable event socket configuration, using defaults");
        }
        config
    }

    /// Merge `listen-ip`, `listen-port`, and `password` from an
    /// `event_socket.conf.xml` file into this configuration.
    pub fn read_conf_file(&mut self, path: impl AsRef<Path>) -> EslResult<()> {
        let text = std::fs::read_to_string(path)?;
        self.apply_conf(&text)
    }

    fn apply_conf(&mut self, xml: &str) -> EslResult<()> {
        let mut reader = Reader::from_str(xml);
        loop {
            match reader.read_event()? {
                XmlEvent::Start(elem) | XmlEvent::Empty(elem)
                    if elem.name().as_ref() == b"param" =>
                {
                    let mut name = None;
                    let mut value = None;
                    for attr in elem.attributes() {
                        let attr = attr.map_err(|e| {
                            EslError::protocol(format!("bad param attribute: {e}"))
                        })?;
                        let text = attr.unescape_value()?.into_owned();
                        match attr.key.as_ref() {
                            b"name" => name = Some(text),
                            b"value" => value = Some(text),
                            _ => {}
                        }
                    }
                    if let (Some(name), Some(value)) = (name, value) {
                        self.apply_param(&name, value)?;
                    }
                }
                XmlEvent::Eof => return Ok(()),
                _ => {}
            }
        }
    }

    fn apply_param(&mut self, name: &str, value: String) -> EslResult<()> {
        match name {
            "listen-ip" => self.hostname = value,
            "listen-port" => {
                self.port = value
                    .trim()
                    .parse()
                    .map_err(|_| EslError::protocol(format!("invalid listen-port: {value:?}")))?;
            }
            "password" => self.password = value,
            _ => {}
        }
        Ok(())
    }
}
