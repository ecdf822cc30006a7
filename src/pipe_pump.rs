//! Nonblocking pipe I/O pump, integrated with a `mio` poll set.
//!
//! Grounded on the teacher's event-loop shape (`transport/shm/notify.rs`
//! drives a similar readable/writable dance over `mio::Poll`), adapted
//! here to pipe fds wrapped with `mio::unix::SourceFd` rather than a shm
//! eventfd.

use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};

use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::error::{Result, SfdError};
use crate::shadow_fd::{CategoryState, PipeState, ShadowFd};
use crate::translation_map::TranslationMap;

/// Count the PIPE-category shadow fds among `remote_ids`, for sizing an
/// `Events` buffer ahead of a poll call.
pub fn count_npipes(map: &TranslationMap, remote_ids: &[i32]) -> usize {
    remote_ids
        .iter()
        .filter(|&&id| matches!(map.lookup_by_remote_id(id).map(|s| s.category), Some(crate::shadow_fd::FdCategory::Pipe)))
        .count()
}

/// Register every PIPE shadow fd's read end with `poll`, keyed by a token
/// derived from its remote id so the poll loop can map events back.
pub fn fill_with_pipes(
    poll: &mio::Poll,
    map: &TranslationMap,
    remote_ids: &[i32],
) -> Result<()> {
    for &remote_id in remote_ids {
        let Some(shadow) = map.lookup_by_remote_id(remote_id) else { continue };
        let CategoryState::Pipe(state) = &shadow.state else { continue };
        if let Some(fd) = state.read_fd {
            poll.registry()
                .register(&mut SourceFd(&fd), Token(remote_id as usize), Interest::READABLE)
                .map_err(|e| SfdError::os("poll_register_read", e))?;
        }
        if let Some(fd) = state.write_fd {
            poll.registry()
                .register(&mut SourceFd(&fd), Token((remote_id as usize) | WRITE_TOKEN_BIT), Interest::WRITABLE)
                .map_err(|e| SfdError::os("poll_register_write", e))?;
        }
    }
    Ok(())
}

/// High bit distinguishing a write-direction token from a read-direction
/// token for the same remote id, since both can be registered at once.
const WRITE_TOKEN_BIT: usize = 1 << 62;

/// Translate a fired `mio::Token` back into `(remote_id, is_writable)`.
pub fn decode_token(token: Token) -> (i32, bool) {
    let raw = token.0;
    if raw & WRITE_TOKEN_BIT != 0 {
        ((raw & !WRITE_TOKEN_BIT) as i32, true)
    } else {
        (raw as i32, false)
    }
}

/// Drain as much of `state.send_buf` as the write end will currently
/// accept, without blocking. Returns the number of bytes flushed.
pub fn flush_writable_pipe(fd: RawFd, state: &mut PipeState) -> Result<usize> {
    let mut total = 0usize;
    loop {
        if state.send_buf.is_empty() {
            break;
        }
        let chunk = state.send_buf.as_slice();
        // SAFETY: fd is a valid, open file descriptor owned by this shadow
        // fd for as long as `state` exists.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let result = file.write(chunk);
        std::mem::forget(file); // don't close fd on scope exit; it's borrowed
        match result {
            Ok(0) => break,
            Ok(n) => {
                state.send_buf.consume_front(n);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(SfdError::os("pipe_write", e)),
        }
    }
    Ok(total)
}

/// Read as much as is currently available from `fd` into `state.recv_buf`,
/// without blocking. Marks `state.pipe_lclosed` on EOF: reading from the
/// private fd that drains this side's locally-owned end, and getting EOF,
/// means that local end itself has closed.
pub fn read_readable_pipe(fd: RawFd, state: &mut PipeState) -> Result<usize> {
    let mut total = 0usize;
    loop {
        let chunk_size = 16 * 1024;
        let dst = state.recv_buf.reserve_tail(chunk_size);
        // SAFETY: see flush_writable_pipe.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let result = file.read(dst);
        std::mem::forget(file);
        match result {
            Ok(0) => {
                state.pipe_lclosed = true;
                break;
            }
            Ok(n) => {
                state.recv_buf.commit(n);
                total += n;
                if n < chunk_size {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(SfdError::os("pipe_read", e)),
        }
    }
    Ok(total)
}

/// Close the remaining private fd(s) of every PIPE shadow fd whose peer
/// reported closure via an incoming transfer's `pipeclose` flag
/// (`planner::apply_update` sets `pipe_rclosed`), so further writes fail
/// fast rather than raising `SIGPIPE`.
pub fn close_rclosed_pipes(map: &mut TranslationMap, remote_ids: &[i32]) {
    for &remote_id in remote_ids {
        let Some(shadow) = map.lookup_by_remote_id_mut(remote_id) else { continue };
        let CategoryState::Pipe(state) = &mut shadow.state else { continue };
        if state.pipe_rclosed {
            for fd in [state.read_fd.take(), state.write_fd.take()].into_iter().flatten() {
                // SAFETY: fd is owned exclusively by this shadow fd.
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}

/// Translate one fired `mio::event::Event` into `state`'s transient poll
/// flags (`spec.md` §4.8). `is_write_token` distinguishes which direction's
/// registration the event came from, since a RW (socketpair) pipe registers
/// the same fd under both a read and a write token.
pub fn mark_pipe_object_statuses(state: &mut PipeState, is_write_token: bool, event: &mio::event::Event) {
    if is_write_token {
        state.pipe_writable = event.is_writable();
        if event.is_write_closed() || event.is_error() {
            state.pipe_lclosed = true;
        }
    } else {
        state.pipe_readable = event.is_readable();
        if event.is_read_closed() || event.is_error() {
            state.pipe_lclosed = true;
        }
    }
}

/// Close both local ends of a PIPE shadow fd unconditionally, used when
/// the fd is being destroyed.
pub fn close_local_pipe_ends(shadow: &mut ShadowFd) {
    if let CategoryState::Pipe(state) = &mut shadow.state {
        for fd in [state.read_fd.take(), state.write_fd.take()].into_iter().flatten() {
            // SAFETY: fd is owned exclusively by this shadow fd.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow_fd::{GrowBuffer, PipeKind};

    fn make_state(read_fd: Option<RawFd>, write_fd: Option<RawFd>) -> PipeState {
        PipeState {
            kind: PipeKind::Rw,
            read_fd,
            write_fd,
            recv_buf: GrowBuffer::with_floor(64),
            send_buf: GrowBuffer::with_floor(64),
            pipe_lclosed: false,
            pipe_rclosed: false,
            pipe_onlyhere: true,
            pipe_readable: false,
            pipe_writable: false,
        }
    }

    #[test]
    fn flush_drains_send_buf_over_a_real_pipe() {
        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        let [read_fd, write_fd] = fds;
        unsafe {
            libc::fcntl(write_fd, libc::F_SETFL, libc::O_NONBLOCK);
        }
        let mut state = make_state(Some(read_fd), Some(write_fd));
        state.send_buf.append(b"hello");
        let n = flush_writable_pipe(write_fd, &mut state).unwrap();
        assert_eq!(n, 5);
        assert!(state.send_buf.is_empty());
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn read_fills_recv_buf_and_detects_eof() {
        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        let [read_fd, write_fd] = fds;
        unsafe {
            libc::fcntl(read_fd, libc::F_SETFL, libc::O_NONBLOCK);
            libc::write(write_fd, b"hi\0".as_ptr() as *const libc::c_void, 2);
            libc::close(write_fd);
        }
        let mut state = make_state(Some(read_fd), None);
        let n = read_readable_pipe(read_fd, &mut state).unwrap();
        assert_eq!(n, 2);
        assert_eq!(state.recv_buf.as_slice(), b"hi");
        assert!(state.pipe_lclosed);
        unsafe {
            libc::close(read_fd);
        }
    }

    #[test]
    fn decode_token_round_trips_direction() {
        let read_token = Token(7);
        let write_token = Token(7 | WRITE_TOKEN_BIT);
        assert_eq!(decode_token(read_token), (7, false));
        assert_eq!(decode_token(write_token), (7, true));
    }

    #[test]
    fn mark_pipe_object_statuses_detects_local_close_on_real_poll() {
        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        let [read_fd, write_fd] = fds;
        unsafe {
            libc::fcntl(read_fd, libc::F_SETFL, libc::O_NONBLOCK);
            libc::close(write_fd);
        }
        let poll = mio::Poll::new().unwrap();
        let mut events = mio::Events::with_capacity(4);
        poll.registry().register(&mut SourceFd(&read_fd), Token(1), Interest::READABLE).unwrap();
        poll.poll(&mut events, Some(std::time::Duration::from_millis(200))).unwrap();

        let mut state = make_state(Some(read_fd), None);
        let mut saw_event = false;
        for event in events.iter() {
            mark_pipe_object_statuses(&mut state, false, event);
            saw_event = true;
        }
        assert!(saw_event, "expected a readiness event once the write end closed");
        assert!(state.pipe_readable || state.pipe_lclosed);
        unsafe {
            libc::close(read_fd);
        }
    }

    #[test]
    fn close_rclosed_pipes_closes_remaining_fds_once_peer_reports_close() {
        use crate::translation_map::{Side, TranslationMap};

        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        let [read_fd, write_fd] = fds;
        let mut map = TranslationMap::new(1, Side::Client);
        let shadow = ShadowFd::new_pipe(read_fd, 1, crate::shadow_fd::PipeKind::Rw, Some(read_fd), Some(write_fd));
        map.register_remote(1, shadow).unwrap();
        if let Some(shadow) = map.lookup_by_remote_id_mut(1) {
            if let CategoryState::Pipe(state) = &mut shadow.state {
                state.pipe_rclosed = true;
            }
        }

        close_rclosed_pipes(&mut map, &[1]);

        let shadow = map.lookup_by_remote_id(1).unwrap();
        let CategoryState::Pipe(state) = &shadow.state else { panic!("not a pipe") };
        assert!(state.read_fd.is_none());
        assert!(state.write_fd.is_none());
    }
}
