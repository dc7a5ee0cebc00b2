use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{JsonRpcRequest, JsonRpcResponse, RequestId};

/// Newline-delimited JSON-RPC client over any byte stream pair.
pub struct LineClient<R, W> {
    reader: BufReader<R>,
    writer: W,
    next_id: i64,
}

impl<R, W> LineClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
        }
    }

    /// Send a request and wait for the next response line.
    pub async fn call(
        &mut self,
        mut request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, std::io::Error> {
        if request.id.is_none() {
            request.id = Some(RequestId::Number(self.next_id));
            self.next_id += 1;
        }
        self.send(&request).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let bytes = self.reader.read_line(&mut line).await?;
            if bytes == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed while waiting for response",
                ));
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        serde_json::from_str(line.trim())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Shorthand for `call` with a fresh id.
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, std::io::Error> {
        let request = JsonRpcRequest {
            jsonrpc: crate::JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        };
        self.call(request).await
    }

    /// Fire a notification; nothing is read back.
    pub async fn notify(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), std::io::Error> {
        self.send(&JsonRpcRequest::notification(method, params)).await
    }

    /// Write a raw line, for exercising a peer's error handling.
    pub async fn send_raw(&mut self, line: &str) -> Result<(), std::io::Error> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Read a single response line without sending anything first.
    pub async fn read_response(&mut self) -> Result<JsonRpcResponse, std::io::Error> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed while waiting for response",
            ));
        }
        serde_json::from_str(line.trim())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner(), self.writer)
    }

    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), std::io::Error> {
        let payload = serde_json::to_string(request)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.send_raw(&payload).await
    }
}
