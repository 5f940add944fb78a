use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::BufReader,
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::{
    error::RpcError,
    frame::{is_blank, read_frame, write_frame},
    jsonrpc::{Id, Request, Response},
};

/// Sequential JSON-RPC client over one TCP connection.
///
/// Used by plugins to reach the registration service, by the router to send
/// the `Init` callback, and by anything that wants to talk to the router.
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: i64,
    buf: Vec<u8>,
}

impl RpcClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    pub fn new(stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            next_id: 0,
            buf: Vec::new(),
        }
    }

    /// Issues `method` and waits for the matching response.
    pub async fn call<P, R>(&mut self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.next_id += 1;
        let id = Id::Number(self.next_id);
        let req = Request::call(id.clone(), method, Some(serde_json::to_value(params)?));
        write_frame(&mut self.writer, &req).await?;

        let resp = self.read_response().await?;
        if resp.id != id {
            return Err(RpcError::Protocol(format!(
                "response id {:?} does not match request id {:?}",
                resp.id, id
            )));
        }
        let value = resp.into_result()?;
        Ok(serde_json::from_value(value)?)
    }

    /// Sends `method` without expecting an answer.
    pub async fn notify<P: Serialize>(&mut self, method: &str, params: P) -> Result<(), RpcError> {
        let req = Request::notification(method, Some(serde_json::to_value(params)?));
        write_frame(&mut self.writer, &req).await
    }

    async fn read_response(&mut self) -> Result<Response, RpcError> {
        loop {
            self.buf.clear();
            if read_frame(&mut self.reader, &mut self.buf).await? == 0 {
                return Err(RpcError::Closed);
            }
            if is_blank(&self.buf) {
                continue;
            }
            return Ok(serde_json::from_slice(&self.buf)?);
        }
    }
}
