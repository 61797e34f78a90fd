// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared harness for the end-to-end tests: compile C with `mcc` onto a
//! RAM disk, load the container with the real loader, then execute the
//! image with a small Thumb interpreter that covers exactly the encodings
//! the code generator emits. `SVC` traps into the real syscall dispatcher,
//! so exit, console, heap, and file syscalls all exercise kernel code.

// Each integration binary pulls in the subset of this module it needs.
#![allow(dead_code)]

use std::collections::VecDeque;

use fs_api::{FileSys, RamDisk};
use kern::load::{load, LoadSummary};
use kern::syscalls::{dispatch, Board, Console, NullBoard, SysOutcome};
use kern::{Arch, Kernel, Priority};

/// LR value planted at entry; reaching it means the program returned.
pub const RETURN_SENTINEL: u32 = 0xFFFF_FFF1;

pub fn arenas() -> (&'static mut [u8], &'static mut [u8]) {
    (
        Box::leak(vec![0u8; 64 * 1024].into_boxed_slice()),
        Box::leak(vec![0u8; 256 * 1024].into_boxed_slice()),
    )
}

pub fn fresh_kernel() -> Kernel<'static> {
    let (k, u) = arenas();
    Kernel::new(k, u, Arch::CortexM33)
}

/// Compiles `source` and loads it, returning the load summary.
pub fn compile_and_load(
    kernel: &mut Kernel<'static>,
    disk: &mut RamDisk,
    source: &str,
) -> Result<LoadSummary, kern::Error> {
    disk.put("prog.c", source.as_bytes());
    mcc::build(disk, &["prog.c".to_string()], "prog.mimi")
        .unwrap_or_else(|e| panic!("compile failed: {e}"));
    load(kernel, disk, "prog.mimi", Priority(10))
}

/// A console that remembers output and replays scripted input.
#[derive(Default)]
pub struct TestConsole {
    pub out: Vec<u8>,
    pub input: VecDeque<u8>,
}

impl Console for TestConsole {
    fn putchar(&mut self, c: u8) {
        self.out.push(c);
    }

    fn getchar(&mut self) -> Option<u8> {
        self.input.pop_front()
    }
}

/// How an emulated program finished.
#[derive(Debug, PartialEq, Eq)]
pub enum Exit {
    /// Control returned through the entry link register; value is r0.
    Returned(u32),
    /// The program called `exit(code)`.
    Exited(u32),
    /// The interpreter hit something it cannot be seeing.
    Fault(String),
}

struct Flags {
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

impl Flags {
    fn nz(&mut self, r: u32) {
        self.n = r & 0x8000_0000 != 0;
        self.z = r == 0;
    }

    fn add(&mut self, a: u32, b: u32) -> u32 {
        let (r, carry) = a.overflowing_add(b);
        self.c = carry;
        self.v = ((a ^ r) & (b ^ r)) & 0x8000_0000 != 0;
        self.nz(r);
        r
    }

    fn sub(&mut self, a: u32, b: u32) -> u32 {
        let r = a.wrapping_sub(b);
        self.c = a >= b;
        self.v = ((a ^ b) & (a ^ r)) & 0x8000_0000 != 0;
        self.nz(r);
        r
    }

    fn cond(&self, cc: u16) -> bool {
        match cc {
            0 => self.z,                      // EQ
            1 => !self.z,                     // NE
            2 => self.c,                      // HS
            3 => !self.c,                     // LO
            4 => self.n,                      // MI
            5 => !self.n,                     // PL
            8 => self.c && !self.z,           // HI
            9 => !self.c || self.z,           // LS
            10 => self.n == self.v,           // GE
            11 => self.n != self.v,           // LT
            12 => !self.z && self.n == self.v, // GT
            13 => self.z || self.n != self.v, // LE
            _ => true,
        }
    }
}

/// Executes the task's image from its entry point. `args` land in r0-r3.
pub fn run_task(
    kernel: &mut Kernel<'static>,
    fs: &mut dyn FileSys,
    console: &mut dyn Console,
    task: usize,
    args: &[u32],
) -> Exit {
    let mut board = NullBoard;
    run_task_on(kernel, fs, console, &mut board, task, args)
}

pub fn run_task_on(
    kernel: &mut Kernel<'static>,
    fs: &mut dyn FileSys,
    console: &mut dyn Console,
    board: &mut dyn Board,
    task: usize,
    args: &[u32],
) -> Exit {
    let save = kernel.tasks.get(task).expect("task").save;
    let mut r = [0u32; 16];
    r[13] = save.sp;
    r[14] = RETURN_SENTINEL;
    r[15] = save.pc & !1;
    for (i, &a) in args.iter().enumerate().take(4) {
        r[i] = a;
    }
    let mut f = Flags {
        n: false,
        z: false,
        c: false,
        v: false,
    };

    let fetch16 = |kernel: &Kernel<'_>, addr: u32| -> Option<u16> {
        let b = kernel.upool.slice(addr, 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    };
    let load32 = |kernel: &Kernel<'_>, addr: u32| -> Option<u32> {
        let b = kernel.upool.slice(addr, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };

    for _step in 0..2_000_000u32 {
        if r[15] & !1 == RETURN_SENTINEL & !1 {
            return Exit::Returned(r[0]);
        }
        let pc = r[15];
        let Some(hw) = fetch16(kernel, pc) else {
            return Exit::Fault(format!("fetch outside image at {pc:#x}"));
        };
        r[15] = pc.wrapping_add(2);

        match hw >> 11 {
            // lsls/lsrs/asrs rd, rm, #imm5
            0b00000 | 0b00001 | 0b00010 => {
                let imm = (hw >> 6) & 0x1F;
                let rm = usize::from((hw >> 3) & 7);
                let rd = usize::from(hw & 7);
                let v = match hw >> 11 {
                    0b00000 => r[rm] << imm,
                    0b00001 => {
                        if imm == 0 {
                            0
                        } else {
                            r[rm] >> imm
                        }
                    }
                    _ => {
                        let sh = if imm == 0 { 31 } else { imm };
                        ((r[rm] as i32) >> sh) as u32
                    }
                };
                r[rd] = v;
                f.nz(v);
            }
            // adds/subs, register and 3-bit immediate
            0b00011 => {
                let rn = usize::from((hw >> 3) & 7);
                let rd = usize::from(hw & 7);
                let operand = if hw & 0x0400 != 0 {
                    u32::from((hw >> 6) & 7)
                } else {
                    r[usize::from((hw >> 6) & 7)]
                };
                r[rd] = if hw & 0x0200 != 0 {
                    f.sub(r[rn], operand)
                } else {
                    f.add(r[rn], operand)
                };
            }
            // movs rd, #imm8
            0b00100 => {
                let rd = usize::from((hw >> 8) & 7);
                r[rd] = u32::from(hw & 0xFF);
                f.nz(r[rd]);
            }
            // cmp rn, #imm8
            0b00101 => {
                let rn = usize::from((hw >> 8) & 7);
                f.sub(r[rn], u32::from(hw & 0xFF));
            }
            // adds rd, #imm8
            0b00110 => {
                let rd = usize::from((hw >> 8) & 7);
                r[rd] = f.add(r[rd], u32::from(hw & 0xFF));
            }
            // subs rd, #imm8
            0b00111 => {
                let rd = usize::from((hw >> 8) & 7);
                r[rd] = f.sub(r[rd], u32::from(hw & 0xFF));
            }
            0b01000 => {
                if hw & 0x0400 == 0 {
                    // Data-processing register group.
                    let op = (hw >> 6) & 0xF;
                    let rm = usize::from((hw >> 3) & 7);
                    let rdn = usize::from(hw & 7);
                    match op {
                        0x0 => {
                            r[rdn] &= r[rm];
                            f.nz(r[rdn]);
                        }
                        0x1 => {
                            r[rdn] ^= r[rm];
                            f.nz(r[rdn]);
                        }
                        0x2 => {
                            r[rdn] = r[rdn].wrapping_shl(r[rm]);
                            f.nz(r[rdn]);
                        }
                        0x3 => {
                            r[rdn] = if r[rm] >= 32 {
                                0
                            } else {
                                r[rdn] >> r[rm]
                            };
                            f.nz(r[rdn]);
                        }
                        0x4 => {
                            let sh = r[rm].min(31);
                            r[rdn] = ((r[rdn] as i32) >> sh) as u32;
                            f.nz(r[rdn]);
                        }
                        0x9 => {
                            r[rdn] = f.sub(0, r[rm]);
                        }
                        0xA => {
                            f.sub(r[rdn], r[rm]);
                        }
                        0xC => {
                            r[rdn] |= r[rm];
                            f.nz(r[rdn]);
                        }
                        0xD => {
                            r[rdn] = r[rdn].wrapping_mul(r[rm]);
                            f.nz(r[rdn]);
                        }
                        0xF => {
                            r[rdn] = !r[rm];
                            f.nz(r[rdn]);
                        }
                        _ => {
                            return Exit::Fault(format!(
                                "dp op {op:#x} at {pc:#x}"
                            ))
                        }
                    }
                } else {
                    // Hi-register mov / bx.
                    match hw & 0xFF00 {
                        0x4600 => {
                            let rd = usize::from(
                                (hw & 7) | ((hw >> 4) & 8),
                            );
                            let rm = usize::from((hw >> 3) & 0xF);
                            r[rd] = r[rm];
                        }
                        0x4700 => {
                            let rm = usize::from((hw >> 3) & 0xF);
                            r[15] = r[rm] & !1;
                        }
                        _ => {
                            return Exit::Fault(format!(
                                "hi-reg {hw:#06x} at {pc:#x}"
                            ))
                        }
                    }
                }
            }
            // ldr rt, [pc, #imm8]
            0b01001 => {
                let rt = usize::from((hw >> 8) & 7);
                let base = (pc.wrapping_add(4)) & !3;
                let addr = base + u32::from(hw & 0xFF) * 4;
                match load32(kernel, addr) {
                    Some(v) => r[rt] = v,
                    None => {
                        return Exit::Fault(format!(
                            "literal load outside image at {addr:#x}"
                        ))
                    }
                }
            }
            // str/ldr rt, [rn, #imm5*4]
            0b01100 | 0b01101 => {
                let imm = u32::from((hw >> 6) & 0x1F) * 4;
                let rn = usize::from((hw >> 3) & 7);
                let rt = usize::from(hw & 7);
                let addr = r[rn].wrapping_add(imm);
                if hw & 0x0800 != 0 {
                    match load32(kernel, addr) {
                        Some(v) => r[rt] = v,
                        None => {
                            return Exit::Fault(format!(
                                "load outside image at {addr:#x}"
                            ))
                        }
                    }
                } else {
                    let Some(m) = kernel.upool.slice_mut(addr, 4) else {
                        return Exit::Fault(format!(
                            "store outside image at {addr:#x}"
                        ));
                    };
                    m.copy_from_slice(&r[rt].to_le_bytes());
                }
            }
            // strb/ldrb rt, [rn, #imm5]
            0b01110 | 0b01111 => {
                let imm = u32::from((hw >> 6) & 0x1F);
                let rn = usize::from((hw >> 3) & 7);
                let rt = usize::from(hw & 7);
                let addr = r[rn].wrapping_add(imm);
                if hw & 0x0800 != 0 {
                    match kernel.upool.slice(addr, 1) {
                        Some(b) => r[rt] = u32::from(b[0]),
                        None => {
                            return Exit::Fault(format!(
                                "byte load outside image at {addr:#x}"
                            ))
                        }
                    }
                } else {
                    let Some(m) = kernel.upool.slice_mut(addr, 1) else {
                        return Exit::Fault(format!(
                            "byte store outside image at {addr:#x}"
                        ));
                    };
                    m[0] = r[rt] as u8;
                }
            }
            // str/ldr rt, [sp, #imm8*4]
            0b10010 | 0b10011 => {
                let rt = usize::from((hw >> 8) & 7);
                let addr = r[13] + u32::from(hw & 0xFF) * 4;
                if hw & 0x0800 != 0 {
                    match load32(kernel, addr) {
                        Some(v) => r[rt] = v,
                        None => {
                            return Exit::Fault(format!(
                                "stack load outside image at {addr:#x}"
                            ))
                        }
                    }
                } else {
                    let Some(m) = kernel.upool.slice_mut(addr, 4) else {
                        return Exit::Fault(format!(
                            "stack store outside image at {addr:#x}"
                        ));
                    };
                    m.copy_from_slice(&r[rt].to_le_bytes());
                }
            }
            // add rd, sp, #imm8*4
            0b10101 => {
                let rd = usize::from((hw >> 8) & 7);
                r[rd] = r[13] + u32::from(hw & 0xFF) * 4;
            }
            0b10110 | 0b10111 => {
                match hw & 0xFF00 {
                    // add/sub sp, #imm7*4
                    0xB000 => {
                        let delta = u32::from(hw & 0x7F) * 4;
                        if hw & 0x80 != 0 {
                            r[13] -= delta;
                        } else {
                            r[13] += delta;
                        }
                    }
                    // push, optionally with lr
                    0xB400 | 0xB500 => {
                        let mut list: Vec<usize> = (0..8)
                            .filter(|&i| hw & (1 << i) != 0)
                            .collect();
                        if hw & 0x100 != 0 {
                            list.push(14);
                        }
                        for &reg in list.iter().rev() {
                            r[13] -= 4;
                            let Some(m) = kernel.upool.slice_mut(r[13], 4)
                            else {
                                return Exit::Fault("push overflow".into());
                            };
                            m.copy_from_slice(&r[reg].to_le_bytes());
                        }
                    }
                    // pop, optionally into pc
                    0xBC00 | 0xBD00 => {
                        for i in 0..8 {
                            if hw & (1 << i) != 0 {
                                let Some(v) = load32(kernel, r[13]) else {
                                    return Exit::Fault(
                                        "pop underflow".into(),
                                    );
                                };
                                r[i] = v;
                                r[13] += 4;
                            }
                        }
                        if hw & 0x100 != 0 {
                            let Some(v) = load32(kernel, r[13]) else {
                                return Exit::Fault("pop underflow".into());
                            };
                            r[13] += 4;
                            if v & !1 == RETURN_SENTINEL & !1 {
                                return Exit::Returned(r[0]);
                            }
                            r[15] = v & !1;
                        }
                    }
                    0xBF00 => {} // nop
                    _ => {
                        return Exit::Fault(format!(
                            "misc {hw:#06x} at {pc:#x}"
                        ))
                    }
                }
            }
            // bcond / svc
            0b11010 | 0b11011 => {
                let cc = (hw >> 8) & 0xF;
                if cc == 0xF {
                    // SVC: syscall number in r7, args in r0-r3.
                    let args = [r[0], r[1], r[2], r[3]];
                    match dispatch(
                        kernel, fs, console, board, task, r[7], args,
                    ) {
                        SysOutcome::Return(v) => r[0] = v,
                        SysOutcome::Exited(code) => {
                            return Exit::Exited(code)
                        }
                    }
                } else if f.cond(cc) {
                    let off = i32::from(hw as u8 as i8) * 2;
                    r[15] = pc.wrapping_add(4).wrapping_add(off as u32);
                }
            }
            // b (unconditional, 11-bit)
            0b11100 => {
                let mut off = i32::from(hw & 0x7FF);
                if off & 0x400 != 0 {
                    off -= 0x800;
                }
                r[15] = pc.wrapping_add(4).wrapping_add((off * 2) as u32);
            }
            // 32-bit branch family: BL and B.W
            0b11110 => {
                let Some(lo) = fetch16(kernel, pc.wrapping_add(2)) else {
                    return Exit::Fault("truncated wide branch".into());
                };
                let Some(target) = abi::thumb::branch_target(pc, hw, lo)
                else {
                    return Exit::Fault(format!(
                        "undecodable wide op {hw:#06x} {lo:#06x} at {pc:#x}"
                    ));
                };
                if abi::thumb::is_bl(hw, lo) {
                    r[14] = pc.wrapping_add(4) | 1;
                }
                r[15] = target;
            }
            _ => {
                return Exit::Fault(format!(
                    "unimplemented opcode {hw:#06x} at {pc:#x}"
                ))
            }
        }
    }
    Exit::Fault("step limit exceeded".into())
}

/// Compile, load, run with no console input; panics on interpreter fault.
pub fn run_c(source: &str, args: &[u32]) -> (Exit, Vec<u8>) {
    let mut kernel = fresh_kernel();
    let mut disk = RamDisk::new();
    let summary =
        compile_and_load(&mut kernel, &mut disk, source).expect("load");
    let mut console = TestConsole::default();
    let exit =
        run_task(&mut kernel, &mut disk, &mut console, summary.task, args);
    if let Exit::Fault(ref why) = exit {
        panic!("emulated program faulted: {why}");
    }
    (exit, console.out)
}
