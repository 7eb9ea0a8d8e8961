use parking_lot::Mutex;
use std::io::BufReader;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{instrument, trace};

use crate::error::{Error, Result};
use crate::types::{Arg, Request, Response};
use crate::utils::{read_frame_blocking, write_frame_blocking};

struct Conn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

/// Client is the blocking counterpart of [`crate::AsyncClient`]. It may be
/// shared between threads; calls on one client take turns on the connection.
pub struct Client {
    conn: Mutex<Conn>,
    seq: AtomicU64,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let writer = TcpStream::connect(addr)?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Client {
            conn: Mutex::new(Conn { reader, writer }),
            seq: AtomicU64::new(0),
        })
    }

    #[instrument(skip(self))]
    pub fn call(&self, method: &str, arg: &Arg) -> Result<String> {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let req = Request {
            id,
            method: method.to_string(),
            arg: arg.clone(),
        };

        let mut guard = self.conn.lock();
        let conn = &mut *guard;
        write_frame_blocking(&mut conn.writer, &req)?;
        trace!(id, "request sent, waiting for reply");
        let resp: Response = read_frame_blocking(&mut conn.reader)?.ok_or(Error::Shutdown)?;
        drop(guard);

        if resp.id != id {
            return Err(Error::Remote(format!(
                "response {} does not match request {id}",
                resp.id
            )));
        }
        resp.into_result()
    }
}
