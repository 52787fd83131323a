use crate::protocol::server::ServiceContext;
use crate::protocol::{handshake, Frame, Protocol, Response};
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpStream;

pub async fn handle_connection(mut stream: TcpStream, ctx: Arc<ServiceContext>) -> Result<()> {
    let hello = handshake::perform_handshake(&mut stream).await?;
    tracing::debug!("Binary client {} connected", hello.client_name);

    while let Some(frame) = Frame::read_from(&mut stream).await? {
        let response = match frame.decode_request() {
            Ok(request) => ctx.dispatch(Protocol::Binary, request).await?,
            Err(e) => {
                tracing::warn!("Rejecting binary frame: {:#}", e);
                Response::error(e.to_string())
            }
        };

        Frame::response(&response)?.write_to(&mut stream).await?;
    }

    Ok(())
}
