//! Async client for talking to the controller as an operator.

use anyhow::Context;
use tokio::net::TcpStream;

use crate::{read_frame_async, write_frame_async, ControlCommand, Hello};

pub struct ControllerClient {
    stream: TcpStream,
}

impl ControllerClient {
    /// Connect to the controller at `addr` and identify as `loom_ctl`.
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to controller at {}", addr))?;
        let mut client = Self { stream };
        write_frame_async(&mut client.stream, &Hello::Ctl.to_string()).await?;
        Ok(client)
    }

    /// Send a command and wait for the controller's reply.
    pub async fn request(&mut self, command: &ControlCommand) -> anyhow::Result<String> {
        write_frame_async(&mut self.stream, &command.to_string()).await?;
        read_frame_async(&mut self.stream)
            .await?
            .context("Controller closed the connection without replying")
    }
}
