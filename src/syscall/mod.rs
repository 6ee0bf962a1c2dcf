//! System-call decoding and dispatch.
//!
//! A syscall trap carries the number in v0 and up to four arguments in
//! a0..a3. The dispatcher marshals arguments out of the caller's memory,
//! runs the handler, writes the result back into v0 and steps the PC past
//! the trapping instruction. `exit` and a PID-1 `halt` end the user thread
//! instead of returning to it.
//!
//! User mistakes (bad descriptors, bad pointers, unterminated strings)
//! come back as -1; an unknown syscall number kills the process the way a
//! bad instruction would.

use crate::kernel::Kernel;
use crate::machine::{Register, TrapOutcome};
use crate::process::{Pid, Process};
use num_enum::TryFromPrimitive;
use std::sync::Arc;

/// The system calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum Syscall {
    /// Stop the machine. PID 1 only; a no-op for everyone else.
    Halt = 0,
    /// End the calling process with a status code.
    Exit = 1,
    /// Spawn a child process from an executable.
    Exec = 2,
    /// Wait for a child to exit and collect its status.
    Join = 3,
    /// Create (or truncate) a file and open it.
    Creat = 4,
    /// Open an existing file.
    Open = 5,
    /// Read from a descriptor.
    Read = 6,
    /// Write to a descriptor.
    Write = 7,
    /// Release a descriptor.
    Close = 8,
    /// Delete a file.
    Unlink = 9,
}

/// Handle a syscall trap from `p`'s user thread.
pub(crate) fn dispatch(k: &Arc<Kernel>, p: &Arc<Process>) -> TrapOutcome {
    let (number, a0, a1, a2) = {
        let ctx = p.ctx().lock();
        (
            ctx.read_register(Register::V0),
            ctx.read_register(Register::A0),
            ctx.read_register(Register::A1),
            ctx.read_register(Register::A2),
        )
    };
    let syscall = match Syscall::try_from(number) {
        Ok(s) => s,
        Err(_) => {
            log::info!("pid {} issued unknown syscall {}", p.pid(), number);
            return k.exit_process(p, -1, true);
        }
    };

    let result: i32 = match syscall {
        Syscall::Halt => {
            if p.pid() == Pid(1) {
                k.halt_machine();
                return TrapOutcome::Finished;
            }
            log::debug!("pid {} asked to halt; refused", p.pid());
            0
        }
        Syscall::Exit => return k.exit_process(p, a0 as i32, false),
        Syscall::Exec => sys_exec(k, p, a0, a1 as i32, a2),
        Syscall::Join => k.join(p, Pid(a0), a1),
        Syscall::Creat => sys_open(k, p, a0, true),
        Syscall::Open => sys_open(k, p, a0, false),
        Syscall::Read => sys_read(k, p, a0 as i32, a1, a2 as i32),
        Syscall::Write => sys_write(k, p, a0 as i32, a1, a2 as i32),
        Syscall::Close => sys_close(p, a0 as i32),
        Syscall::Unlink => sys_unlink(k, p, a0),
    };

    let mut ctx = p.ctx().lock();
    ctx.write_register(Register::V0, result as u32);
    ctx.advance_pc();
    TrapOutcome::Continue
}

/// Read a NUL-terminated string argument, capped at the configured length.
fn read_user_string(k: &Kernel, p: &Process, va: u32) -> Option<String> {
    let max = k.config().max_syscall_arg;
    let mut st = p.state();
    st.aspace.as_mut()?.read_vm_string(k, va, max)
}

fn sys_exec(k: &Arc<Kernel>, p: &Arc<Process>, name_va: u32, argc: i32, argv_va: u32) -> i32 {
    let name = match read_user_string(k, p, name_va) {
        Some(n) => n,
        None => return -1,
    };
    if argc < 0 || argc as usize * 4 > k.machine().page_size() {
        return -1;
    }

    let mut args = Vec::with_capacity(argc as usize);
    {
        let mut pointers = vec![0u8; argc as usize * 4];
        let mut st = p.state();
        let aspace = match st.aspace.as_mut() {
            Some(a) => a,
            None => return -1,
        };
        if aspace.read_vm(k, argv_va, &mut pointers) != pointers.len() {
            return -1;
        }
        for chunk in pointers.chunks_exact(4) {
            let va = u32::from_le_bytes(chunk.try_into().unwrap());
            match aspace.read_vm_string(k, va, k.config().max_syscall_arg) {
                Some(s) => args.push(s),
                None => return -1,
            }
        }
    }

    match k.exec(&name, &args, Some(p)) {
        Ok(pid) => pid.0 as i32,
        Err(e) => {
            log::debug!("pid {}: exec {} failed: {:?}", p.pid(), name, e);
            -1
        }
    }
}

fn sys_open(k: &Kernel, p: &Process, name_va: u32, create: bool) -> i32 {
    let name = match read_user_string(k, p, name_va) {
        Some(n) => n,
        None => return -1,
    };
    let file = match k.fs().open(&name, create) {
        Some(f) => f,
        None => return -1,
    };
    match p.state().fds.allocate(file) {
        Some(fd) => fd as i32,
        None => -1,
    }
}

fn sys_read(k: &Kernel, p: &Process, fd: i32, buf_va: u32, count: i32) -> i32 {
    if count < 0 {
        return -1;
    }
    let file = match p.state().fds.get(fd) {
        Some(f) => f,
        None => return -1,
    };
    let mut kbuf = vec![0u8; k.machine().page_size()];
    let mut remaining = count as usize;
    let mut total = 0usize;
    while remaining > 0 {
        let chunk = remaining.min(kbuf.len());
        let n = match file.read(&mut kbuf[..chunk]) {
            Ok(n) => n,
            Err(_) => return -1,
        };
        if n == 0 {
            break;
        }
        let copied = {
            let mut st = p.state();
            match st.aspace.as_mut() {
                Some(a) => a.write_vm(k, buf_va.wrapping_add(total as u32), &kbuf[..n]),
                None => 0,
            }
        };
        if copied != n {
            return -1;
        }
        total += n;
        remaining -= n;
        if n < chunk {
            break;
        }
    }
    total as i32
}

fn sys_write(k: &Kernel, p: &Process, fd: i32, buf_va: u32, count: i32) -> i32 {
    if count < 0 {
        return -1;
    }
    let file = match p.state().fds.get(fd) {
        Some(f) => f,
        None => return -1,
    };
    let mut kbuf = vec![0u8; k.machine().page_size()];
    let mut remaining = count as usize;
    let mut total = 0usize;
    while remaining > 0 {
        let chunk = remaining.min(kbuf.len());
        let copied = {
            let mut st = p.state();
            match st.aspace.as_mut() {
                Some(a) => a.read_vm(k, buf_va.wrapping_add(total as u32), &mut kbuf[..chunk]),
                None => 0,
            }
        };
        if copied != chunk {
            return -1;
        }
        let n = match file.write(&kbuf[..chunk]) {
            Ok(n) => n,
            Err(_) => return -1,
        };
        total += n;
        remaining -= n;
        if n < chunk {
            break;
        }
    }
    total as i32
}

fn sys_close(p: &Process, fd: i32) -> i32 {
    if p.state().fds.close(fd) {
        0
    } else {
        -1
    }
}

fn sys_unlink(k: &Kernel, p: &Process, name_va: u32) -> i32 {
    let name = match read_user_string(k, p, name_va) {
        Some(n) => n,
        None => return -1,
    };
    if k.fs().remove(&name) {
        0
    } else {
        -1
    }
}
