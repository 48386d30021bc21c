//! Server shell: configuration, callback registration and the accept loop.

use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::TcpListener;

use crate::{
    connection::{self, Client},
    error_info,
    handshake::HeaderMap,
    ErrorInfo, Result, WebSocketError,
};

/// Port used by convention when none is configured.
pub const DEFAULT_PORT: u16 = 8080;

/// Per-server settings, shared read-only by every connection.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Capacity of the per-connection read buffer. The buffer accumulates
    /// partial frames across socket reads, so this bounds throughput, not
    /// correctness. Must not exceed `max_msg_size`.
    pub read_buffer_size: usize,
    /// Largest accepted message, counted across all fragments after
    /// decompression.
    pub max_msg_size: usize,
    /// Negotiate permessage-deflate. When set, clients that do not offer
    /// the extension are rejected during the handshake.
    pub compression: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_buffer_size: 65535,
            max_msg_size: u32::MAX as usize,
            compression: false,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.read_buffer_size > self.max_msg_size {
            return Err(WebSocketError::ConfigReadBufferExceedsMaxMessage {
                read_buffer_size: self.read_buffer_size,
                max_msg_size: self.max_msg_size,
            });
        }
        #[cfg(not(target_pointer_width = "64"))]
        if self.read_buffer_size > 65535 {
            return Err(WebSocketError::ConfigReadBufferNeeds64Bit {
                read_buffer_size: self.read_buffer_size,
            });
        }
        Ok(())
    }
}

pub(crate) type HandshakeHandler = Box<dyn Fn(&HeaderMap) -> bool + Send + Sync>;
pub(crate) type DataHandler = Box<dyn Fn(Client, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type ClientHandler = Box<dyn Fn(Client) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type ErrorHandler =
    Box<dyn Fn(Option<Client>, ErrorInfo) -> BoxFuture<'static, ()> + Send + Sync>;

/// The table of registered event handlers. Unset entries are simply not
/// invoked.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) handshake: Option<HandshakeHandler>,
    pub(crate) disconnect: Option<ClientHandler>,
    pub(crate) error: Option<ErrorHandler>,
    pub(crate) text: Option<DataHandler>,
    pub(crate) binary: Option<DataHandler>,
    pub(crate) close: Option<DataHandler>,
    pub(crate) ping: Option<DataHandler>,
    pub(crate) pong: Option<DataHandler>,
}

/// A WebSocket server.
///
/// Configure it, register handlers, then call [`Server::listen`]. Once
/// listening, configuration and handlers are frozen; every connection runs
/// on its own tokio task and sees the same shared, read-only callback
/// table.
///
/// ```no_run
/// # async fn run() -> wavesock::Result<()> {
/// let mut server = wavesock::Server::new([0, 0, 0, 0].into(), wavesock::DEFAULT_PORT);
/// server.on_binary(|client, data| async move {
///     let _ = client.binary(&data).await;
/// });
/// server.listen().await
/// # }
/// ```
pub struct Server {
    addr: SocketAddr,
    config: Config,
    callbacks: Callbacks,
}

impl Server {
    /// Creates a server that will bind `ip:port` when [`Server::listen`] is
    /// called.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
            config: Config::default(),
            callbacks: Callbacks::default(),
        }
    }

    /// Replaces the configuration. Call before [`Server::listen`].
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    /// The address this server will bind.
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Registers the handshake handler. It receives the upgrade request's
    /// headers and may veto the connection by returning `false`, which
    /// answers `400 Bad Request`.
    pub fn on_handshake<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.callbacks.handshake = Some(Box::new(handler));
        self
    }

    /// Registers the handler for complete text messages.
    pub fn on_text<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Client, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.text = Some(box_data_handler(handler));
        self
    }

    /// Registers the handler for complete binary messages.
    pub fn on_binary<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Client, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.binary = Some(box_data_handler(handler));
        self
    }

    /// Registers the handler for close frames. The payload carries the
    /// 2-byte status code and optional reason as received; answer with
    /// [`Client::close`] to complete the closing handshake.
    pub fn on_close<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Client, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.close = Some(box_data_handler(handler));
        self
    }

    /// Registers the handler for ping frames. The engine does not answer
    /// pings on its own; echo the payload with [`Client::pong_with`] if the
    /// peer expects one.
    pub fn on_ping<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Client, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.ping = Some(box_data_handler(handler));
        self
    }

    /// Registers the handler for pong frames.
    pub fn on_pong<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Client, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.pong = Some(box_data_handler(handler));
        self
    }

    /// Registers the handler invoked exactly once when a connection ends,
    /// on every exit path after a completed handshake.
    pub fn on_disconnect<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.disconnect =
            Some(Box::new(move |client| -> BoxFuture<'static, ()> {
                Box::pin(handler(client))
            }));
        self
    }

    /// Registers the error handler. The client is absent for errors raised
    /// by the accept loop itself.
    pub fn on_error<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Option<Client>, ErrorInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.error =
            Some(Box::new(move |client, info| -> BoxFuture<'static, ()> {
                Box::pin(handler(client, info))
            }));
        self
    }

    /// Binds the configured address and serves connections forever.
    pub async fn listen(self) -> Result<()> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from a listener the caller bound, forever.
    ///
    /// Useful with port 0 in tests, or when the listener needs socket
    /// options this crate does not manage.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.config.validate()?;

        let config = self.config;
        let callbacks = Arc::new(self.callbacks);

        log::debug!(
            "listening on {} (compression={})",
            listener.local_addr()?,
            config.compression
        );

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let callbacks = Arc::clone(&callbacks);
                    tokio::spawn(async move {
                        connection::handle(stream, addr, &config, &callbacks).await;
                    });
                }
                Err(err) => {
                    log::error!("accepting connection failed: {err}");
                    connection::report_error(
                        &callbacks,
                        None,
                        error_info!("accept_loop", err.into()),
                    )
                    .await;
                }
            }
        }
    }
}

fn box_data_handler<F, Fut>(handler: F) -> DataHandler
where
    F: Fn(Client, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |client, data| -> BoxFuture<'static, ()> {
        Box::pin(handler(client, data))
    })
}
