//! # wire
//!
//! why: put `Message`s on a TCP stream, one JSON document per line
//! relations: used by server.rs on accepted sockets and by the coordinator and client on outbound ones
//! what: Connection, call

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tpc_core::{KvError, Message};

/// Longest line accepted from a peer. Covers a maximum-size value even when
/// every byte needs JSON escaping.
const MAX_FRAME: u64 = 1024 * 1024;

/// Newline-framed message stream over one socket.
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: String,
}

impl Connection {
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            peer,
        })
    }

    /// Connects to `addr`, giving up after `timeout` per resolved address.
    pub fn connect(addr: &str, timeout: Duration) -> io::Result<Self> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Self::from_stream(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{addr} did not resolve"))
        }))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.writer.local_addr()
    }

    /// Bounds every later `recv` and `send`.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.writer.set_read_timeout(timeout)?;
        self.writer.set_write_timeout(timeout)
    }

    pub fn send(&mut self, msg: &Message) -> Result<(), KvError> {
        let mut line = msg.encode()?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .map_err(|err| classify(err, &self.peer))?;
        self.writer.flush().map_err(|err| classify(err, &self.peer))
    }

    /// Next message, or `None` once the peer has closed its side.
    pub fn recv(&mut self) -> Result<Option<Message>, KvError> {
        let mut line = String::new();
        let read = (&mut self.reader)
            .take(MAX_FRAME)
            .read_line(&mut line)
            .map_err(|err| classify(err, &self.peer))?;
        if read == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && read as u64 == MAX_FRAME {
            return Err(KvError::Protocol(format!(
                "frame from {} exceeds {MAX_FRAME} bytes",
                self.peer
            )));
        }
        Message::decode(&line).map(Some)
    }

    /// One request, one reply.
    pub fn request(&mut self, msg: &Message) -> Result<Message, KvError> {
        self.send(msg)?;
        self.recv()?.ok_or_else(|| {
            KvError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection without replying", self.peer),
            ))
        })
    }

    pub fn close(self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

/// Opens a fresh connection, exchanges one request and reply, and closes it.
pub fn call(addr: &str, msg: &Message, timeout: Duration) -> Result<Message, KvError> {
    let mut conn = Connection::connect(addr, timeout).map_err(|err| classify(err, addr))?;
    conn.set_timeout(Some(timeout))?;
    let reply = conn.request(msg);
    conn.close();
    reply
}

fn classify(err: io::Error, peer: &str) -> KvError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            KvError::Timeout(format!("no reply from {peer}"))
        }
        _ => KvError::Io(err),
    }
}
