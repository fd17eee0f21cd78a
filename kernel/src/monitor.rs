//! Interactive kernel monitor
//!
//! A minimal console REPL, entered from the breakpoint and debug
//! vectors and from `panic!`. Commands are deliberately few: enough to
//! inspect the machine and resume (or not).

#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::trap::Trapframe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// List the commands
    Help,
    /// Kernel memory and environment statistics
    KernInfo,
    /// Dump the trap frame the monitor was entered with
    TrapFrame,
    /// Leave the monitor, resuming the interrupted environment
    Exit,
    Empty,
    Unknown,
}

/// Parse one input line. The first whitespace-separated word selects
/// the command; arguments are not used by any current command.
pub fn parse_command(line: &str) -> Command {
    match line.split_whitespace().next() {
        None => Command::Empty,
        Some("help") => Command::Help,
        Some("kerninfo") => Command::KernInfo,
        Some("trapframe") => Command::TrapFrame,
        Some("exit") | Some("continue") => Command::Exit,
        Some(_) => Command::Unknown,
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn print_help() {
    println!("help      - display this list of commands");
    println!("kerninfo  - display kernel statistics");
    println!("trapframe - dump the saved trap frame");
    println!("exit      - resume the interrupted environment");
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn print_kerninfo() {
    let alloc = crate::mm::page_allocator();
    println!(
        "physical pages: {} total, {} free",
        alloc.npages(),
        alloc.free_count()
    );
    drop(alloc);
    println!("environments:   {} live", crate::env::env_table().live_count());
    println!("cpu:            {}", crate::cpu::cpu_index());
}

/// Block until a full line is typed, with echo and rubout.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn read_line(buf: &mut [u8]) -> usize {
    let mut len = 0;
    loop {
        crate::console::poll_input();
        let Some(byte) = crate::console::getchar() else {
            core::hint::spin_loop();
            continue;
        };
        match byte {
            b'\r' | b'\n' => {
                println!();
                return len;
            }
            0x08 | 0x7f if len > 0 => {
                len -= 1;
                crate::console::write_bytes(&[0x08]);
            }
            byte if byte.is_ascii_graphic() || byte == b' ' => {
                if len < buf.len() {
                    buf[len] = byte;
                    len += 1;
                    crate::console::write_bytes(&[byte]);
                }
            }
            _ => {}
        }
    }
}

/// The monitor loop. With a trap frame, `exit` returns to the caller
/// (which resumes the interrupted environment); without one there is
/// nothing to resume and the loop never exits.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn run(tf: Option<&Trapframe>) {
    println!("Welcome to the kernel monitor!");
    println!("Type 'help' for a list of commands.");

    let mut buf = [0u8; 128];
    loop {
        print!("K> ");
        let len = read_line(&mut buf);
        let line = core::str::from_utf8(&buf[..len]).unwrap_or("");
        match parse_command(line) {
            Command::Help => print_help(),
            Command::KernInfo => print_kerninfo(),
            Command::TrapFrame => match tf {
                Some(tf) => crate::trap::print_trapframe(tf),
                None => println!("no trap frame"),
            },
            Command::Exit if tf.is_some() => return,
            Command::Exit => println!("nothing to resume"),
            Command::Empty => {}
            Command::Unknown => println!("unknown command '{}'", line),
        }
    }
}

/// Terminal monitor entry: no environment to resume, never returns.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn enter() -> ! {
    run(None);
    unreachable!("monitor with no trap frame cannot exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing() {
        assert_eq!(parse_command("help"), Command::Help);
        assert_eq!(parse_command("  kerninfo  "), Command::KernInfo);
        assert_eq!(parse_command("exit"), Command::Exit);
        assert_eq!(parse_command("continue now"), Command::Exit);
        assert_eq!(parse_command("trapframe"), Command::TrapFrame);
        assert_eq!(parse_command(""), Command::Empty);
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(parse_command("reboot"), Command::Unknown);
    }
}
