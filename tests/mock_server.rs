//! Mock FreeSWITCH ESL server for integration testing

use std::net::SocketAddr;
use std::time::Duration;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use freeswitch_esl_client::{ClientConfig, EslClient, EslResult};

pub struct MockEslServer {
    listener: TcpListener,
    password: String,
}

pub struct MockClient {
    stream: BufReader<TcpStream>,
}

impl MockEslServer {
    pub async fn start(password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self {
            listener,
            password: password.to_string(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Accept a connection and perform the full handshake: auth request,
    /// password check, and the client's initial event subscription.
    pub async fn accept(&self) -> MockClient {
        let (stream, _addr) = self.listener.accept().await.unwrap();
        let mut client = MockClient {
            stream: BufReader::new(stream),
        };

        client.send_raw("Content-Type: auth/request\n\n").await;

        let cmd = client.read_command().await;
        if cmd == format!("auth {}\n\n", self.password) {
            client.reply_ok().await;
        } else {
            client.reply_err("invalid").await;
            return client;
        }

        // The client subscribes to its registered handlers right after
        // authenticating (at minimum BACKGROUND_JOB).
        let subscription = client.read_command().await;
        assert!(
            subscription.starts_with("events plain "),
            "expected subscription, got: {subscription:?}"
        );
        client.reply_ok().await;

        client
    }
}

impl MockClient {
    pub async fn send_raw(&mut self, data: &str) {
        self.stream.get_mut().write_all(data.as_bytes()).await.unwrap();
    }

    /// Read a command from the client (everything up to and including the
    /// terminating blank line).
    pub async fn read_command(&mut self) -> String {
        let mut result = String::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.unwrap();
            if n == 0 {
                break;
            }
            result.push_str(&line);
            if result.ends_with("\n\n") {
                break;
            }
        }
        result
    }

    /// Send a `+OK` command reply
    pub async fn reply_ok(&mut self) {
        self.send_raw("Content-Type: command/reply\nReply-Text: +OK accepted\n\n")
            .await;
    }

    /// Send a `-ERR` command reply
    pub async fn reply_err(&mut self, text: &str) {
        let msg = format!("Content-Type: command/reply\nReply-Text: -ERR {}\n\n", text);
        self.send_raw(&msg).await;
    }

    /// Send an `api/response` with the given body
    pub async fn reply_api(&mut self, body: &str) {
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        self.send_raw(&data).await;
    }

    /// Acknowledge a `bgapi` command, echoing its Job-UUID
    pub async fn reply_bgapi_ok(&mut self, job_id: &str) {
        let msg = format!(
            "Content-Type: command/reply\nReply-Text: +OK Job-UUID: {job_id}\nJob-UUID: {job_id}\n\n"
        );
        self.send_raw(&msg).await;
    }

    /// Send a `text/event-plain` event with correct two-part wire format
    pub async fn send_event_plain(&mut self, event_name: &str, headers: &[(&str, &str)]) {
        self.send_event_with_body(event_name, headers, "").await;
    }

    /// Send a `text/event-plain` event carrying a sub-body
    pub async fn send_event_with_body(
        &mut self,
        event_name: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) {
        let mut block = format!(
            "Event-Name: {}\n",
            percent_encode(event_name.as_bytes(), NON_ALPHANUMERIC)
        );
        for (name, value) in headers {
            block.push_str(&format!(
                "{}: {}\n",
                name,
                percent_encode(value.as_bytes(), NON_ALPHANUMERIC)
            ));
        }
        if !body.is_empty() {
            block.push_str(&format!("Content-Length: {}\n", body.len()));
        }
        block.push('\n');
        block.push_str(body);

        let envelope = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n",
            block.len()
        );
        self.send_raw(&format!("{envelope}{block}")).await;
    }

    /// Send the BACKGROUND_JOB completion event for the given job
    pub async fn send_background_job(&mut self, job_id: &str, body: &str) {
        self.send_event_with_body("BACKGROUND_JOB", &[("Job-UUID", job_id)], body)
            .await;
    }

    /// Send a disconnect notice
    pub async fn send_disconnect_notice(&mut self, message: &str) {
        let data = format!(
            "Content-Type: text/disconnect-notice\nContent-Disposition: disconnect\nContent-Length: {}\n\n{}",
            message.len(),
            message
        );
        self.send_raw(&data).await;
    }

    /// Drop the TCP connection
    pub async fn drop_connection(self) {
        drop(self.stream);
    }
}

/// A client pointed at the mock server.
pub fn client_for(port: u16, password: &str) -> EslClient {
    EslClient::with_config(ClientConfig {
        hostname: "127.0.0.1".to_string(),
        port,
        password: password.to_string(),
        timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    })
}

/// Create a connected pair: the mock's side of the socket, the client, and
/// the task running `connect`.
pub async fn setup_connected_pair() -> (MockClient, EslClient, JoinHandle<EslResult<()>>) {
    let server = MockEslServer::start("ClueCon").await;
    let client = client_for(server.port(), "ClueCon");
    let session = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let mock = server.accept().await;
    (mock, client, session)
}
