// kernel/src/kernel/monitor.rs
//
// 簡単なカーネルモニタ。breakpoint と「走れる env が 1 つも無い」ときに入る。
// - 入力は console の getc から 1 行ずつ読む
// - continue / c で抜ける。入力が尽きたときも抜ける（ホスト実行では誰も打たないので）

use alloc::string::String;
use alloc::vec::Vec;

use super::{EnvStatus, KernelState, LogEvent};
use crate::arch::trapframe::Trapframe;

const MAXARGS: usize = 16;
const MAXLINE: usize = 1024;

/// true を返したらモニタを抜ける
type CommandFn = fn(&mut KernelState, &[&str], Option<&Trapframe>) -> bool;

struct Command {
    name: &'static str,
    desc: &'static str,
    func: CommandFn,
}

const COMMANDS: &[Command] = &[
    Command {
        name: "help",
        desc: "Display this list of commands",
        func: mon_help,
    },
    Command {
        name: "kerninfo",
        desc: "Display information about the kernel",
        func: mon_kerninfo,
    },
    Command {
        name: "envs",
        desc: "List live environments",
        func: mon_envs,
    },
    Command {
        name: "continue",
        desc: "Leave the monitor and resume",
        func: mon_continue,
    },
    Command {
        name: "c",
        desc: "Alias for continue",
        func: mon_continue,
    },
];

fn mon_help(ks: &mut KernelState, _args: &[&str], _tf: Option<&Trapframe>) -> bool {
    for c in COMMANDS {
        cprintf!(ks, "{} - {}\n", c.name, c.desc);
    }
    false
}

fn mon_kerninfo(ks: &mut KernelState, _args: &[&str], _tf: Option<&Trapframe>) -> bool {
    let total = ks.pmm.total_frames();
    let free = ks.pmm.free_frames();
    let used = ks.pmm.in_use_frames();
    let live = ks.envs.iter().filter(|e| e.status != EnvStatus::Free).count();
    cprintf!(ks, "Physical frames:\n");
    cprintf!(ks, "  total  {}\n", total);
    cprintf!(ks, "  free   {}\n", free);
    cprintf!(ks, "  in use {}\n", used);
    cprintf!(ks, "Environments: {} live\n", live);
    false
}

fn mon_envs(ks: &mut KernelState, _args: &[&str], _tf: Option<&Trapframe>) -> bool {
    let rows: Vec<_> = ks
        .envs
        .iter()
        .filter(|e| e.status != EnvStatus::Free)
        .map(|e| (e.id, e.parent_id, e.status, e.runs))
        .collect();
    for (id, parent, status, runs) in rows {
        cprintf!(ks, "{} parent {} {:?} runs {}\n", id, parent, status, runs);
    }
    false
}

fn mon_continue(_ks: &mut KernelState, _args: &[&str], _tf: Option<&Trapframe>) -> bool {
    true
}

impl KernelState {
    //
    // monitor()
    //
    pub fn monitor(&mut self, tf: Option<&Trapframe>) {
        let cpu = self.this_cpu;
        self.push_event(LogEvent::MonitorEntered { cpu });

        cprintf!(self, "Welcome to the JOS kernel monitor!\n");
        cprintf!(self, "Type 'help' for a list of commands.\n");

        if let Some(tf) = tf {
            self.print_trapframe(tf);
        }

        loop {
            let Some(line) = self.readline("K> ") else {
                break;
            };
            if self.runcmd(&line, tf) {
                break;
            }
        }
    }

    /// 1 行読む。入力が 1 文字も無ければ None。
    fn readline(&mut self, prompt: &str) -> Option<String> {
        cprintf!(self, "{}", prompt);

        let mut line = String::new();
        let mut got_any = false;
        while let Some(c) = self.console.getc() {
            got_any = true;
            match c {
                b'\n' | b'\r' => break,
                // backspace
                0x08 | 0x7f => {
                    line.pop();
                }
                c if c >= b' ' && line.len() < MAXLINE - 1 => line.push(c as char),
                _ => {}
            }
        }
        if !got_any {
            cprintf!(self, "\n");
            return None;
        }
        cprintf!(self, "{}\n", line);
        Some(line)
    }

    fn runcmd(&mut self, line: &str, tf: Option<&Trapframe>) -> bool {
        let args: Vec<&str> = line.split_whitespace().collect();
        if args.is_empty() {
            return false;
        }
        if args.len() > MAXARGS {
            cprintf!(self, "Too many arguments (max {})\n", MAXARGS);
            return false;
        }

        match COMMANDS.iter().find(|c| c.name == args[0]) {
            Some(c) => (c.func)(self, &args, tf),
            None => {
                cprintf!(self, "Unknown command '{}'\n", args[0]);
                false
            }
        }
    }
}
