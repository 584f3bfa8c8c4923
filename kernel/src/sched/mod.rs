//! Kernel-task scheduling.
//!
//! Tasks live in an arena; the ready ring is the `next` index chain, which
//! always cycles back to the head. The boot flow itself is task 0 and uses
//! the boot stack. Switches happen three ways: the timer handler rewrites
//! the interrupt frame it was given, [`schedule`] swaps registers through
//! the context trampoline, and [`yield_now`] simply halts until the next
//! tick does the work.
//!
//! Every scheduler entry point from base-level code masks interrupts while
//! the scheduler lock is held, so the timer handler can never deadlock
//! against it.

pub mod context;

use crate::interrupts::gdt;
use crate::interrupts::idt::InterruptFrame;
use self::context::{switch_context, TaskContext, DEFAULT_RFLAGS};
use alloc::vec::Vec;
use log::{debug, info, warn};
use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Arena index of a task; stable for the lifetime of the kernel because
/// TCBs are never removed.
pub type TaskId = usize;

/// Task control block.
pub struct Tcb {
    pub pid: u32,
    pub state: TaskState,
    context: TaskContext,
    #[allow(dead_code)]
    stack_base: VirtAddr,
    #[allow(dead_code)]
    stack_size: usize,
    has_run: bool,
    next: TaskId,
}

struct Scheduler {
    tasks: Vec<Tcb>,
    head: Option<TaskId>,
    current: Option<TaskId>,
    next_pid: u32,
    ready: bool,
}

impl Scheduler {
    const fn new() -> Self {
        Scheduler {
            tasks: Vec::new(),
            head: None,
            current: None,
            next_pid: 1,
            ready: false,
        }
    }

    /// The round-robin successor of the current task, if it is runnable
    /// and distinct.
    fn pick_next(&self) -> Option<TaskId> {
        let current = self.current?;
        let next = self.tasks[current].next;
        if next == current || self.tasks[next].state != TaskState::Ready {
            return None;
        }
        Some(next)
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    interrupts::without_interrupts(|| f(&mut SCHEDULER.lock()))
}

/// A context seeded with the flat kernel segments and interrupts enabled.
fn seeded_context() -> TaskContext {
    let mut context = TaskContext::zeroed();
    context.rflags = DEFAULT_RFLAGS;
    context.cs = gdt::kernel_code_selector().0;
    let data = gdt::kernel_data_selector().0;
    context.ss = data;
    context.ds = data;
    context.es = data;
    context.fs = data;
    context.gs = data;
    context
}

/// Registers the boot flow as pid 0. It is Running, rings to itself, and
/// keeps using the boot stack; its context gets filled in at the first
/// preemption.
pub fn init_kernel_task() {
    with_scheduler(|sched| {
        assert!(sched.tasks.is_empty(), "kernel task must be registered first");
        sched.tasks.push(Tcb {
            pid: 0,
            state: TaskState::Running,
            context: seeded_context(),
            stack_base: VirtAddr::zero(),
            stack_size: 0,
            has_run: true,
            next: 0,
        });
        sched.head = Some(0);
        sched.current = Some(0);
    });
    info!("kernel task registered as pid 0");
}

/// Creates a Ready task that will enter `entry` on `stack` at its first
/// dispatch. The task is appended before the ring head, preserving FIFO
/// dispatch order.
pub fn create_task(
    entry: extern "C" fn() -> !,
    stack_base: VirtAddr,
    stack_size: usize,
) -> TaskId {
    let (id, pid) = with_scheduler(|sched| {
        let id = sched.tasks.len();
        let pid = sched.next_pid;
        sched.next_pid += 1;

        let mut context = seeded_context();
        context.rip = entry as usize as u64;
        context.rsp = stack_base.as_u64() + stack_size as u64 - 16;

        let mut tcb = Tcb {
            pid,
            state: TaskState::Ready,
            context,
            stack_base,
            stack_size,
            has_run: false,
            next: id,
        };

        if let Some(head) = sched.head {
            let mut last = head;
            while sched.tasks[last].next != head {
                last = sched.tasks[last].next;
            }
            tcb.next = head;
            sched.tasks[last].next = id;
        } else {
            sched.head = Some(id);
        }
        sched.tasks.push(tcb);
        (id, pid)
    });
    info!(
        "created task pid {}, entry {:#x}, stack {:#x}+{:#x}",
        pid,
        entry as usize,
        stack_base.as_u64(),
        stack_size
    );
    id
}

/// Marks a task Terminated. Its slot and stack stay claimed; the ring
/// selector simply never picks it again.
pub fn terminate(id: TaskId) {
    with_scheduler(|sched| {
        if id < sched.tasks.len() {
            sched.tasks[id].state = TaskState::Terminated;
        }
    });
}

/// Opens the gate for timer-driven switching.
pub fn start_scheduler() {
    let started = with_scheduler(|sched| {
        if sched.current.is_none() || sched.head.is_none() {
            warn!("cannot start scheduler without a current task");
            return false;
        }
        sched.ready = true;
        true
    });
    if started {
        print_ready_ring();
        info!("scheduler started");
    }
}

/// Dumps the ring for diagnostics, marking the current task.
pub fn print_ready_ring() {
    with_scheduler(|sched| {
        info!("task ring:");
        let Some(head) = sched.head else {
            info!("  (empty)");
            return;
        };
        let mut id = head;
        for _ in 0..sched.tasks.len() {
            let task = &sched.tasks[id];
            let marker = if Some(id) == sched.current {
                " <- current"
            } else {
                ""
            };
            info!(
                "  pid {}: {:?}, next pid {}{}",
                task.pid, task.state, sched.tasks[task.next].pid, marker
            );
            id = task.next;
            if id == head {
                break;
            }
        }
    });
}

/// Pid of the task currently executing, when the scheduler is tracking one.
pub fn current_pid() -> Option<u32> {
    with_scheduler(|sched| sched.current.map(|id| sched.tasks[id].pid))
}

fn save_frame(frame: &InterruptFrame, context: &mut TaskContext) {
    context.rax = frame.regs.rax;
    context.rbx = frame.regs.rbx;
    context.rcx = frame.regs.rcx;
    context.rdx = frame.regs.rdx;
    context.rsi = frame.regs.rsi;
    context.rdi = frame.regs.rdi;
    context.rbp = frame.regs.rbp;
    context.r8 = frame.regs.r8;
    context.r9 = frame.regs.r9;
    context.r10 = frame.regs.r10;
    context.r11 = frame.regs.r11;
    context.r12 = frame.regs.r12;
    context.r13 = frame.regs.r13;
    context.r14 = frame.regs.r14;
    context.r15 = frame.regs.r15;
    context.rip = frame.rip;
    context.rsp = frame.rsp;
    context.rflags = frame.rflags;
    context.cs = frame.cs as u16;
    context.ss = frame.ss as u16;
}

fn restore_frame(context: &TaskContext, frame: &mut InterruptFrame) {
    frame.regs.rax = context.rax;
    frame.regs.rbx = context.rbx;
    frame.regs.rcx = context.rcx;
    frame.regs.rdx = context.rdx;
    frame.regs.rsi = context.rsi;
    frame.regs.rdi = context.rdi;
    frame.regs.rbp = context.rbp;
    frame.regs.r8 = context.r8;
    frame.regs.r9 = context.r9;
    frame.regs.r10 = context.r10;
    frame.regs.r11 = context.r11;
    frame.regs.r12 = context.r12;
    frame.regs.r13 = context.r13;
    frame.regs.r14 = context.r14;
    frame.regs.r15 = context.r15;
    frame.rip = context.rip;
    frame.rsp = context.rsp;
    frame.rflags = context.rflags;
    frame.cs = u64::from(context.cs);
    frame.ss = u64::from(context.ss);
}

/// Timer-driven switch. Saves the interrupted state into the current TCB,
/// pivots to the ring successor and rewrites the frame so the trampoline's
/// `iretq` resumes the new task. A no-op until [`start_scheduler`] and
/// whenever there is nothing runnable to switch to.
pub fn schedule_from_interrupt(frame: &mut InterruptFrame) {
    // Interrupt gates enter with interrupts masked, and every base-level
    // holder of this lock masks them too, so the lock is uncontended here.
    let mut sched = SCHEDULER.lock();
    if !sched.ready {
        return;
    }
    let Some(current) = sched.current else {
        return;
    };
    let Some(next) = sched.pick_next() else {
        return;
    };

    save_frame(frame, &mut sched.tasks[current].context);
    sched.tasks[current].state = TaskState::Ready;

    sched.current = Some(next);
    let task = &mut sched.tasks[next];
    task.state = TaskState::Running;
    if !task.has_run {
        task.has_run = true;
        debug!("first dispatch of pid {}", task.pid);
    }
    restore_frame(&task.context, frame);
}

/// Voluntary switch through the register-swap trampoline. Only for kernel
/// code that holds no locks.
pub fn schedule() {
    interrupts::disable();
    let switch = {
        let mut sched = SCHEDULER.lock();
        match sched.pick_next() {
            Some(next) => {
                let current = sched.current.expect("pick_next implies a current task");
                sched.tasks[current].state = TaskState::Ready;
                sched.current = Some(next);
                sched.tasks[next].state = TaskState::Running;
                sched.tasks[next].has_run = true;
                let old = &mut sched.tasks[current].context as *mut TaskContext;
                let new = &sched.tasks[next].context as *const TaskContext;
                Some((old, new))
            }
            None => None,
        }
    };
    if let Some((old, new)) = switch {
        // The arena cannot move between dropping the lock and the swap:
        // interrupts are masked and nothing else runs on this CPU.
        unsafe {
            switch_context(old, new);
        }
    }
    interrupts::enable();
}

/// Gives up the CPU until the next timer tick picks another task.
pub fn yield_now() {
    interrupts::enable_and_hlt();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::idt::SavedRegisters;
    use alloc::vec;

    extern "C" fn parked_task() -> ! {
        loop {
            yield_now();
        }
    }

    fn spawn_parked() -> (TaskId, u64) {
        let stack = vec![0u8; 4096].leak();
        let base = VirtAddr::from_ptr(stack.as_ptr());
        (create_task(parked_task, base, 4096), base.as_u64())
    }

    /// New tasks join a cyclic ring, are seeded with the flat kernel
    /// segments, and exactly one task stays Running.
    #[test_case]
    fn ring_links_and_seeded_contexts() {
        let (t1, stack1) = spawn_parked();
        let (t2, _) = spawn_parked();

        assert_eq!(current_pid(), Some(0));
        with_scheduler(|sched| {
            assert!(sched.tasks[t1].pid < sched.tasks[t2].pid);

            let head = sched.head.unwrap();
            let mut id = sched.tasks[head].next;
            let mut hops = 1;
            while id != head {
                id = sched.tasks[id].next;
                hops += 1;
                assert!(hops <= sched.tasks.len(), "ready ring does not cycle");
            }

            let running = sched
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Running)
                .count();
            assert_eq!(running, 1);

            let task = &sched.tasks[t1];
            assert_eq!(task.state, TaskState::Ready);
            assert!(!task.has_run);
            assert_eq!(task.context.rflags, DEFAULT_RFLAGS);
            assert_eq!(task.context.cs, 0x08);
            assert_eq!(task.context.ss, 0x10);
            assert_eq!(task.context.rsp, stack1 + 4096 - 16);
        });
    }

    /// Before `start_scheduler`, a timer tick must not touch the frame.
    #[test_case]
    fn tick_before_start_is_inert() {
        let mut frame = InterruptFrame {
            regs: SavedRegisters::default(),
            vector: 0x20,
            error_code: 0,
            rip: 0x1234,
            cs: 0x08,
            rflags: DEFAULT_RFLAGS,
            rsp: 0x5678,
            ss: 0x10,
        };
        let snapshot = frame;
        schedule_from_interrupt(&mut frame);
        assert_eq!(frame, snapshot);
    }

    /// Terminated tasks keep their slot but are never selected.
    #[test_case]
    fn terminated_tasks_are_skipped() {
        let (id, _) = spawn_parked();
        terminate(id);
        with_scheduler(|sched| {
            assert_eq!(sched.tasks[id].state, TaskState::Terminated);
            if let Some(next) = sched.pick_next() {
                assert_eq!(sched.tasks[next].state, TaskState::Ready);
            }
        });
    }
}
