use std::{future::Future, net::SocketAddr, time::Duration};

use derive_builder::Builder;
use log::{debug, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::Mutex, time::timeout};

use crate::{
    classifier::DeliveryError,
    sink::{Sink, SinkResult},
};

/// Delimiter-framed TCP transport. Connects lazily and reconnects after any write failure
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct TcpSink {
    addr: SocketAddr,
    #[builder(default = "Duration::from_secs(5)")]
    connect_timeout: Duration,
    #[builder(default = "Duration::from_secs(5)")]
    write_timeout: Duration,
    #[builder(setter(into), default = "b\"\\n\".to_vec()")]
    delimiter: Vec<u8>,
    #[builder(private, default)]
    stream: Mutex<Option<TcpStream>>,
}

impl TcpSink {
    async fn connect(&self) -> Result<TcpStream, DeliveryError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| DeliveryError::Timeout)??;

        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
        if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!("Unable to enable keepalive towards {}: {}", self.addr, err);
        }

        debug!("Connected to {}", self.addr);
        Ok(stream)
    }

    async fn write(&self, payload: &[u8]) -> SinkResult {
        let mut guard = self.stream.lock().await;

        //A failed connection is never put back
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let res = timeout(self.write_timeout, async {
            stream.write_all(payload).await?;
            stream.write_all(&self.delimiter).await?;
            stream.flush().await
        })
        .await;

        match res {
            Ok(Ok(())) => {
                *guard = Some(stream);
                Ok(())
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(DeliveryError::Timeout),
        }
    }
}

impl Sink for TcpSink {
    fn send(&self, payload: &[u8]) -> impl Future<Output = SinkResult> + Send {
        self.write(payload)
    }
}
