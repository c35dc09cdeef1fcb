//! The command server: drives a target through `SetTgt`/`Fuzz`/`SetCtx`/`Execute` commands
//! arriving on the command pipe, forking a fresh child to actually run the target so a crash
//! or hang there can never take the server itself down. Ported from
//! `se_command_server.c`'s `SE_(start_server)`/`handle_command`/`wait_for_child`.

pub mod state;

use std::convert::TryFrom;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, fork, pipe, ForkResult, Pid};

use crate::config::Config;
use crate::executor::{self, ExecutionOutcome, Executor};
use crate::iovec::{codec, IoVec};
use crate::proto::{self, FdStream, Message, Tag};
use crate::taint;

use state::ServerState;

/// A resolved call target: its address (already bias-corrected once a tracee exists) and
/// whether that bias still needs to be resolved against a freshly spawned process.
#[derive(Clone, Debug)]
struct Target {
    path: PathBuf,
    file_relative_addr: u64,
    is_pie: bool,
}

/// `SE_(cmd_server)`. Owns the pipe endpoints and the state that needs to survive across
/// commands but not across a fork (the fork only carries `target`/`current_io_vec`/`config`
/// forward into the child that actually runs the target).
pub struct CommandServer {
    config: Config,
    state: ServerState,
    target: Option<Target>,
    using_fuzzed_io_vec: bool,
    using_existing_io_vec: bool,
    current_io_vec: Option<IoVec>,
    running_pid: Option<Pid>,
    executor_read_fd: Option<RawFd>,
}

impl CommandServer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: ServerState::WaitForStart,
            target: None,
            using_fuzzed_io_vec: false,
            using_existing_io_vec: false,
            current_io_vec: None,
            running_pid: None,
            executor_read_fd: None,
        }
    }

    fn transition(&mut self, next: ServerState) -> bool {
        if !state::is_valid_transition(self.state, next) {
            log::warn!("rejecting transition {} -> {}", self.state, next);
            return false;
        }
        log::debug!("{} -> {}", self.state, next);
        self.state = next;
        true
    }

    fn write_to_commander(&mut self, msg: Message) {
        let mut out = FdStream(self.config.cmd_out);
        if let Err(e) = proto::write_message(&mut out, &msg) {
            log::warn!("failed to write {:?} message to commander: {:#}", msg.tag, e);
        }
    }

    fn read_from_commander(&mut self) -> Result<Message> {
        let mut input = FdStream(self.config.cmd_in);
        proto::read_message(&mut input)
    }

    fn report_error(&mut self, reason: Option<&str>) {
        let msg = match reason {
            Some(reason) => Message::fail(reason),
            None => Message::fail_empty(),
        };
        self.write_to_commander(msg);
        self.transition(ServerState::ReportError);
    }

    fn report_success(&mut self, payload: Vec<u8>) {
        self.write_to_commander(Message::ok(payload));
    }

    fn send_ack(&mut self) {
        self.write_to_commander(Message::empty(Tag::Ack));
    }

    /// `SE_(start_server)`: announce readiness, then loop reading commands until `Exit`.
    pub fn run(&mut self) -> Result<()> {
        self.transition(ServerState::Start);
        self.write_to_commander(Message::empty(Tag::Ready));
        self.transition(ServerState::WaitForTarget);

        loop {
            let cmd_in = self.config.cmd_in;
            let mut fds = [PollFd::new(cmd_in, PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLPRI)];
            poll(&mut fds, -1).context("poll on command pipe failed")?;

            let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
                match self.handle_command()? {
                    Action::Stop => return Ok(()),
                    Action::Fork { fetch_init_state_only } => self.fork_and_execute(fetch_init_state_only)?,
                    Action::Continue => {}
                }
            } else if revents.contains(PollFlags::POLLHUP) {
                log::info!("commander closed the command pipe");
                return Ok(());
            }

            if self.state == ServerState::Exit {
                return Ok(());
            }
        }
    }

    /// `handle_command`: read one command, ack it, then dispatch. Always returns `Ok`; a
    /// handler failure is reported to the commander as a `FAIL`, not propagated.
    fn handle_command(&mut self) -> Result<Action> {
        let msg = self.read_from_commander()?;
        self.send_ack();

        let action = match msg.tag {
            Tag::SetTgt => self.handle_set_target(&msg.payload, false),
            Tag::SetSoTgt => self.handle_set_target(&msg.payload, true),
            Tag::Fuzz => self.handle_fuzz(),
            Tag::SetCtx => self.handle_set_ctx(&msg.payload),
            Tag::Execute => self.handle_execute(false),
            Tag::FetchInitialState => self.handle_execute(true),
            Tag::Reset => self.handle_reset(),
            Tag::Exit => {
                self.transition(ServerState::Exit);
                Some(Action::Stop)
            }
            other => {
                log::warn!("ignoring unexpected message tag on command pipe: {:?}", other);
                None
            }
        };

        Ok(action.unwrap_or(Action::Continue))
    }

    /// `handle_set_target_cmd`. `SetTgt`'s payload is the bare function name, looked up in
    /// `config.target_path`; `SetSoTgt`'s payload is `"<path-to-.so>\0<symbol>"`, looked up in
    /// that shared object instead.
    fn handle_set_target(&mut self, payload: &[u8], shared_object: bool) -> Option<Action> {
        let resolved = if shared_object {
            self.resolve_so_target(payload)
        } else {
            self.resolve_main_target(payload)
        };

        match resolved {
            Ok(target) => {
                log::info!("found {:?} at file-relative address 0x{:x}", target.path, target.file_relative_addr);
                self.target = Some(target);
                if self.transition(ServerState::WaitForCmd) {
                    self.report_success(Vec::new());
                }
            }
            Err(e) => {
                self.target = None;
                self.report_error(Some(&format!("{:#}", e)));
            }
        }

        None
    }

    fn resolve_main_target(&self, payload: &[u8]) -> Result<Target> {
        let name = std::str::from_utf8(payload).context("function name is not valid utf-8")?;
        let path = self.config.target_path.clone().ok_or_else(|| anyhow!("no target binary configured"))?;

        let file_relative_addr = executor::symbols::lookup_symbol(&path, name)?;
        let is_pie = executor::symbols::is_pie(&path)?;

        Ok(Target { path, file_relative_addr, is_pie })
    }

    fn resolve_so_target(&self, payload: &[u8]) -> Result<Target> {
        let text = std::str::from_utf8(payload).context("SetSoTgt payload is not valid utf-8")?;
        let (path, name) = text.split_once('\0').ok_or_else(|| anyhow!("SetSoTgt payload missing NUL separator"))?;
        let path = PathBuf::from(path);

        let file_relative_addr = executor::symbols::lookup_symbol(&path, name)?;
        let is_pie = executor::symbols::is_pie(&path)?;

        Ok(Target { path, file_relative_addr, is_pie })
    }

    /// `fuzz_program_state`: seeds a fresh `IoVec` with a pseudo-random first argument
    /// register, keyed off this process's own pid/ppid the same way the original did.
    fn handle_fuzz(&mut self) -> Option<Action> {
        if !self.transition(ServerState::Fuzzing) {
            self.report_error(Some("cannot fuzz in the current state"));
            return None;
        }

        let mut io_vec = IoVec::new();
        let seed = ((std::process::id() as u64) << 9) ^ nix::unistd::getppid().as_raw() as u64;
        io_vec.random_seed = seed as u32;
        io_vec.initial_state.register_state[0].value = seed;
        log::info!("setting first argument register = 0x{:x}", seed);

        self.current_io_vec = Some(io_vec);
        self.using_fuzzed_io_vec = true;
        self.using_existing_io_vec = false;

        if !self.transition(ServerState::WaitingToExecute) {
            self.report_error(Some("invalid state after fuzzing"));
            return None;
        }

        self.report_success(Vec::new());
        None
    }

    /// `SEMSG_SET_CTX`: installs a driver-supplied `IoVec` verbatim as the context to execute.
    fn handle_set_ctx(&mut self, payload: &[u8]) -> Option<Action> {
        if !self.transition(ServerState::SettingCtx) {
            self.report_error(Some("cannot set context in the current state"));
            return None;
        }

        match codec::read_io_vec(payload) {
            Ok(io_vec) => {
                self.current_io_vec = Some(io_vec);
                self.using_existing_io_vec = true;
                self.using_fuzzed_io_vec = false;
                if self.transition(ServerState::WaitingToExecute) {
                    self.report_success(Vec::new());
                }
            }
            Err(e) => self.report_error(Some(&format!("malformed IOVec: {:#}", e))),
        }

        None
    }

    fn handle_reset(&mut self) -> Option<Action> {
        self.current_io_vec = None;
        self.using_fuzzed_io_vec = false;
        self.using_existing_io_vec = false;
        self.transition(ServerState::WaitForCmd);
        self.report_success(Vec::new());
        None
    }

    /// `SEMSG_EXECUTE`/`FetchInitialState`: transitions to `Executing`/`GettingInitState` and
    /// tells `run` to fork a child to do the actual work.
    fn handle_execute(&mut self, fetch_init_state_only: bool) -> Option<Action> {
        let next = if fetch_init_state_only { ServerState::GettingInitState } else { ServerState::Executing };

        if self.target.is_none() {
            self.report_error(Some("no target set"));
            return None;
        }
        if self.current_io_vec.is_none() {
            self.report_error(Some("no program state set; send Fuzz or SetCtx first"));
            return None;
        }

        if !self.transition(next) {
            self.report_error(Some("cannot execute in the current state"));
            return None;
        }

        Some(Action::Fork { fetch_init_state_only })
    }

    /// Forks a child to run the target, then polls the executor pipe in the parent
    /// (`wait_for_child`) until the child reports in or the timeout elapses.
    fn fork_and_execute(&mut self, fetch_init_state_only: bool) -> Result<()> {
        let (read_fd, write_fd) = pipe().context("executor pipe failed")?;

        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Child => {
                close(read_fd).ok();
                close(self.config.cmd_in).ok();
                close(self.config.cmd_out).ok();

                let code = match self.run_in_child(write_fd, fetch_init_state_only) {
                    Ok(()) => 0,
                    Err(e) => {
                        log::error!("executor child failed: {:#}", e);
                        let mut out = FdStream(write_fd);
                        let _ = proto::write_message(&mut out, &Message::fail(format!("{:#}", e)));
                        1
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                close(write_fd).ok();
                self.running_pid = Some(child);
                self.executor_read_fd = Some(read_fd);
                self.wait_for_child();
                Ok(())
            }
        }
    }

    /// Everything that happens in the forked child: attach/spawn, reach the target, run it
    /// once, and report the outcome down the executor pipe. Never returns to `run`'s loop.
    fn run_in_child(&mut self, write_fd: RawFd, fetch_init_state_only: bool) -> Result<()> {
        let target = self.target.as_ref().ok_or_else(|| anyhow!("no target set"))?.clone();
        let io_vec = self.current_io_vec.clone().ok_or_else(|| anyhow!("no program state set"))?;

        let tracee = executor::spawn_or_attach(
            Some(target.path.as_path()),
            &self.config.tracee_args,
            self.config.tracee_pid,
            self.config.bitness,
            self.config.ignore_unsupported_memops,
            self.config.debug_on_fault,
        )?;

        let target_addr =
            executor::resolve_runtime_address(tracee.pid(), &target.path, target.file_relative_addr, target.is_pie)?;

        let mut exec = Executor::new(tracee, target_addr, self.config.bitness, self.config.entry_strategy);

        let outcome = match exec.run_to_target(&io_vec, fetch_init_state_only)? {
            Some(outcome) => outcome,
            None => exec.run_target()?,
        };

        let mut out = FdStream(write_fd);
        let coverage = match &outcome {
            ExecutionOutcome::Success { coverage, .. } if self.config.collect_coverage && !fetch_init_state_only => {
                Some(coverage.clone())
            }
            _ => None,
        };

        let msg = match outcome {
            ExecutionOutcome::InitialState(regs) => {
                let mut reported = io_vec.clone();
                reported.initial_state.register_state = executor::register_state_from(&regs);
                Message::ok(codec::write_io_vec(&reported))
            }
            ExecutionOutcome::Success { return_value, syscalls, .. } => {
                let mut reported = io_vec.clone();
                reported.return_value = return_value;
                reported.system_calls = syscalls;
                reported.expected_state = executor::capture_expected_state(exec.tracee_mut(), &io_vec.initial_state);
                Message::ok(codec::write_io_vec(&reported))
            }
            ExecutionOutcome::Fault(taint_result) => {
                Message { tag: Tag::NewAlloc, payload: taint::encode_new_alloc(&taint_result) }
            }
        };

        proto::write_message(&mut out, &msg)?;

        // `write_coverage_to_cmd_server`: a second, independent message reporting the unique
        // instruction pointers observed, sent only when coverage was asked for.
        if let Some(coverage) = coverage {
            let ips: std::collections::BTreeSet<i64> = coverage.into_iter().map(|ip| ip as i64).collect();
            let memo = proto::memoize_oset(&ips);
            proto::write_message(&mut out, &Message { tag: Tag::Coverage, payload: memo.bytes })?;
        }

        Ok(())
    }

    /// `wait_for_child`: poll the executor pipe for a message or a timeout, forward whatever
    /// arrives to the commander, then reap the child and go back to `WaitForCmd`.
    fn wait_for_child(&mut self) {
        let read_fd = match self.executor_read_fd {
            Some(fd) => fd,
            None => return,
        };

        let mut fds = [PollFd::new(read_fd, PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLPRI)];
        let timeout_ms = i32::try_from(self.config.timeout_ms).unwrap_or(i32::MAX);

        match poll(&mut fds, timeout_ms) {
            Ok(0) => self.report_error(Some("Child timed out")),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
                    let mut input = FdStream(read_fd);
                    match proto::read_message(&mut input) {
                        Ok(msg) => {
                            self.write_to_commander(msg);
                            // A successful execution with coverage requested writes a second,
                            // independent `Coverage` message right behind the first one; anything
                            // else is a one-shot reply and this poll will simply find nothing.
                            if let Some(extra) = self.try_read_trailing_executor_message(read_fd) {
                                self.write_to_commander(extra);
                            }
                        }
                        Err(e) => self.report_error(Some(&format!("error reading executor pipe: {:#}", e))),
                    }
                } else if revents.contains(PollFlags::POLLHUP) {
                    self.report_error(Some("executor hung up without reporting"));
                } else {
                    self.report_error(None);
                }
            }
            Err(e) => self.report_error(Some(&format!("poll on executor pipe failed: {:#}", e))),
        }

        self.cleanup_child();
    }

    /// After the first reply, gives the executor a brief window to write a trailing `Coverage`
    /// message. A timeout, hangup, or malformed read here is not an error — most commands only
    /// ever send one reply.
    fn try_read_trailing_executor_message(&self, read_fd: RawFd) -> Option<Message> {
        let mut fds = [PollFd::new(read_fd, PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLPRI)];
        match poll(&mut fds, 50) {
            Ok(n) if n > 0 => {
                let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
                if !revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
                    return None;
                }
                let mut input = FdStream(read_fd);
                match proto::read_message(&mut input) {
                    Ok(msg) if !(msg.tag == Tag::Fail && msg.payload.is_empty()) => Some(msg),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn cleanup_child(&mut self) {
        if let Some(pid) = self.running_pid.take() {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {}
                _ => {
                    let _ = signal::kill(pid, Signal::SIGKILL);
                    let _ = waitpid(pid, None);
                }
            }
        }
        if let Some(fd) = self.executor_read_fd.take() {
            let _ = close(fd);
        }
        self.transition(ServerState::WaitForCmd);
    }
}

/// What `handle_command` decided `run`'s poll loop should do next.
enum Action {
    Continue,
    Fork { fetch_init_state_only: bool },
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EntryStrategy;

    fn test_config(cmd_in: RawFd, cmd_out: RawFd) -> Config {
        Config {
            target_path: None,
            tracee_pid: None,
            tracee_args: Vec::new(),
            bitness: 64,
            ignore_unsupported_memops: false,
            debug_on_fault: false,
            disable_aslr: false,
            collect_coverage: false,
            entry_strategy: EntryStrategy::Breakpoint,
            timeout_ms: 1000,
            cmd_in,
            cmd_out,
        }
    }

    fn read_one(fd: RawFd) -> Message {
        let mut input = FdStream(fd);
        proto::read_message(&mut input).expect("read message")
    }

    #[test]
    fn test_set_target_without_binary_reports_error() {
        let (cmd_in, cmd_out) = pipe().unwrap();
        let (reply_read, reply_write) = pipe().unwrap();
        let mut server = CommandServer::new(test_config(cmd_in, reply_write));
        server.state = ServerState::WaitForCmd;

        server.handle_set_target(b"main", false);

        let msg = read_one(reply_read);
        assert_eq!(msg.tag, Tag::Fail);
        assert!(server.target.is_none());

        close(cmd_in).ok();
        close(cmd_out).ok();
        close(reply_write).ok();
        close(reply_read).ok();
    }

    #[test]
    fn test_fuzz_seeds_first_argument_register_and_advances_state() {
        let (cmd_in, cmd_out) = pipe().unwrap();
        let (reply_read, reply_write) = pipe().unwrap();
        let mut server = CommandServer::new(test_config(cmd_in, reply_write));
        server.state = ServerState::WaitForCmd;

        server.handle_fuzz();

        let msg = read_one(reply_read);
        assert_eq!(msg.tag, Tag::Ok);
        assert_eq!(server.state, ServerState::WaitingToExecute);
        assert!(server.using_fuzzed_io_vec);
        assert!(!server.using_existing_io_vec);
        let io_vec = server.current_io_vec.as_ref().expect("io_vec set");
        assert_eq!(io_vec.initial_state.register_state[0].value, io_vec.random_seed as u64);

        close(cmd_in).ok();
        close(cmd_out).ok();
        close(reply_write).ok();
        close(reply_read).ok();
    }

    #[test]
    fn test_fuzz_rejected_from_wrong_state() {
        let (cmd_in, cmd_out) = pipe().unwrap();
        let (reply_read, reply_write) = pipe().unwrap();
        let mut server = CommandServer::new(test_config(cmd_in, reply_write));
        server.state = ServerState::WaitForTarget;

        server.handle_fuzz();

        let msg = read_one(reply_read);
        assert_eq!(msg.tag, Tag::Fail);
        assert!(server.current_io_vec.is_none());
        assert_eq!(server.state, ServerState::WaitForTarget);

        close(cmd_in).ok();
        close(cmd_out).ok();
        close(reply_write).ok();
        close(reply_read).ok();
    }

    #[test]
    fn test_execute_without_target_or_context_reports_error() {
        let (cmd_in, cmd_out) = pipe().unwrap();
        let (reply_read, reply_write) = pipe().unwrap();
        let mut server = CommandServer::new(test_config(cmd_in, reply_write));
        server.state = ServerState::WaitForCmd;

        let action = server.handle_execute(false);

        assert!(action.is_none());
        let msg = read_one(reply_read);
        assert_eq!(msg.tag, Tag::Fail);

        close(cmd_in).ok();
        close(cmd_out).ok();
        close(reply_write).ok();
        close(reply_read).ok();
    }

    #[test]
    fn test_reset_clears_io_vec_and_flags() {
        let (cmd_in, cmd_out) = pipe().unwrap();
        let (reply_read, reply_write) = pipe().unwrap();
        let mut server = CommandServer::new(test_config(cmd_in, reply_write));
        server.state = ServerState::WaitForCmd;
        server.current_io_vec = Some(IoVec::new());
        server.using_fuzzed_io_vec = true;

        server.handle_reset();

        let msg = read_one(reply_read);
        assert_eq!(msg.tag, Tag::Ok);
        assert!(server.current_io_vec.is_none());
        assert!(!server.using_fuzzed_io_vec);
        assert!(!server.using_existing_io_vec);
        assert_eq!(server.state, ServerState::WaitForCmd);

        close(cmd_in).ok();
        close(cmd_out).ok();
        close(reply_write).ok();
        close(reply_read).ok();
    }
}
