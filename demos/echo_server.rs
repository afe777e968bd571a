//! Echo server running one coroutine per connection on a single thread and epoll instance.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example echo_server -- 127.0.0.1:8080
//! nc 127.0.0.1 8080
//! ```

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use slab::Slab;
use spindle::{Coroutine, Status};

/// Epoll token of the listening socket, connections use their slab key.
const LISTENER: u64 = u64::MAX;
const MAX_EVENTS: usize = 64;
const STACK_SIZE: usize = 256 * 1024;

/// Yielded by a connection blocked on its socket.
const WOULD_BLOCK: usize = 0;

fn main() -> io::Result<()> {
    env_logger::init();

    let address = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let listener = TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;

    let epoll = Epoll::new()?;
    epoll.add(listener.as_raw_fd(), libc::EPOLLIN as u32, LISTENER)?;
    log::info!("listening on {}", listener.local_addr()?);

    let mut connections = Slab::new();
    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

    loop {
        let ready = epoll.wait(&mut events)?;

        for event in &events[..ready] {
            let token = event.u64;
            if token == LISTENER {
                accept_all(&listener, &epoll, &mut connections)?;
                continue;
            }

            let key = token as usize;
            if let Some(coroutine) = connections.get_mut(key) {
                if coroutine.resume() == Status::Done {
                    // closing the socket already removed it from epoll
                    connections.remove(key);
                }
            }
        }
    }
}

fn accept_all(listener: &TcpListener, epoll: &Epoll, connections: &mut Slab<Coroutine>) -> io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                log::warn!("accept failed: {error}");
                return Ok(());
            }
        };
        stream.set_nonblocking(true)?;
        let fd = stream.into_raw_fd();

        let entry = connections.vacant_entry();
        let events = (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32;
        if let Err(error) = epoll.add(fd, events, entry.key() as u64) {
            log::warn!("failed to watch client {fd}: {error}");
            drop(unsafe { TcpStream::from_raw_fd(fd) });
            continue;
        }

        log::info!("client {fd} connected from {peer}");
        let mut coroutine = Coroutine::new(connection, fd as usize, STACK_SIZE);

        // runs until it first blocks
        if coroutine.resume() == Status::Waiting {
            entry.insert(coroutine);
        }
    }
}

/// Body of a connection's coroutine, owns the socket [fd].
fn connection(fd: usize) -> isize {
    let mut stream = unsafe { TcpStream::from_raw_fd(fd as RawFd) };
    let mut buffer = [0; 1024];

    loop {
        match stream.read(&mut buffer) {
            Ok(0) => {
                log::info!("client {fd} disconnected");
                return 0;
            }
            Ok(length) => {
                log::debug!("client {fd} sent {:?}", String::from_utf8_lossy(&buffer[..length]));
                if let Err(error) = write_all(&mut stream, &buffer[..length]) {
                    log::warn!("client {fd} write failed: {error}");
                    return -1;
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => spindle::yield_now(WOULD_BLOCK),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                log::warn!("client {fd} read failed: {error}");
                return -1;
            }
        }
    }
}

fn write_all(stream: &mut TcpStream, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => bytes = &bytes[written..],
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => spindle::yield_now(WOULD_BLOCK),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }

    Ok(())
}

/// Readiness notifications for a set of file descriptors.
struct Epoll(RawFd);

impl Epoll {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Epoll(fd))
    }

    fn add(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        let result = unsafe { libc::epoll_ctl(self.0, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Blocks until at least one watched descriptor is ready.
    fn wait(&self, events: &mut [libc::epoll_event]) -> io::Result<usize> {
        loop {
            let ready = unsafe { libc::epoll_wait(self.0, events.as_mut_ptr(), events.len() as i32, -1) };
            if ready >= 0 {
                return Ok(ready as usize);
            }

            let error = io::Error::last_os_error();
            if error.kind() != io::ErrorKind::Interrupted {
                return Err(error);
            }
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}
