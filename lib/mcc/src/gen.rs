// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thumb-2 code generation.
//!
//! Walks the arena tree and emits half-words into a flat TEXT buffer, DATA
//! bytes for globals and string literals, and the relocation and symbol
//! records that make the output linkable. The register discipline is
//! deliberately small:
//!
//! - every expression leaves its value in r0;
//! - binary operators evaluate the left operand, push it, evaluate the
//!   right operand, then pop the left into r1 and combine (operand order is
//!   preserved for subtraction and shifts);
//! - locals live in stack slots addressed off SP; r7 is only ever touched
//!   by the syscall trampoline, which saves and restores it.
//!
//! Forward control flow goes through label ids: a branch to an unbound
//! label emits a placeholder B.W and is patched when the function is
//! finished. Conditional branches only ever skip a fixed-size sequence, so
//! the 8-bit conditional range cannot overflow. Wide immediates are
//! synthesised byte-by-byte; addresses of globals load PC-relative from a
//! per-function literal pool whose slots carry ABS32 relocations.
//!
//! `/` and `%` have no Thumb encoding on this profile; they lower to the
//! kernel's sdiv/smod syscalls through the same trampoline as named
//! syscalls.

use abi::mimi::{Reloc, Symbol};
use abi::{thumb, RelocKind, Section, SymbolKind, Sysnum};
use fnv::FnvHashMap;

use crate::ast::{
    Base, BinOp, CType, Expr, ExprId, FuncDef, GlobalInit, Stmt, StmtId,
    UnOp, Unit,
};
use crate::strtab::StrTab;
use crate::obj::ObjectFile;
use crate::{Diag, Error};

// Condition codes.
const EQ: u16 = 0;
const NE: u16 = 1;
const GE: u16 = 10;
const LT: u16 = 11;
const GT: u16 = 12;
const LE: u16 = 13;

// Fixed instruction words.
const PUSH_CALLEE: u16 = 0xB5F0; // push {r4-r7, lr}
const POP_CALLEE: u16 = 0xBDF0; // pop {r4-r7, pc}
const PUSH_R0: u16 = 0xB401;
const PUSH_R7: u16 = 0xB480;
const POP_R1: u16 = 0xBC02;
const POP_R7: u16 = 0xBC80;
const NOP: u16 = 0xBF00;
const SVC0: u16 = 0xDF00;
const RSBS_R0: u16 = 0x4240; // rsbs r0, r0, #0
const MVNS_R0: u16 = 0x43C0; // mvns r0, r0
const CMP_R1_R0: u16 = 0x4281; // cmp r1, r0
const MOV_R0_R1: u16 = 0x4608;
const MOV_R2_R0: u16 = 0x4602;
const MOV_R1_R2: u16 = 0x4611;

fn movs(rd: u16, imm: u16) -> u16 {
    0x2000 | rd << 8 | imm
}

fn cmp_imm0(rn: u16) -> u16 {
    0x2800 | rn << 8
}

fn adds_imm8(rd: u16, imm: u16) -> u16 {
    0x3000 | rd << 8 | imm
}

fn subs_imm8(rd: u16, imm: u16) -> u16 {
    0x3800 | rd << 8 | imm
}

fn adds_imm3(rd: u16, rn: u16, imm: u16) -> u16 {
    0x1C00 | imm << 6 | rn << 3 | rd
}

fn adds3(rd: u16, rn: u16, rm: u16) -> u16 {
    0x1800 | rm << 6 | rn << 3 | rd
}

fn subs3(rd: u16, rn: u16, rm: u16) -> u16 {
    0x1A00 | rm << 6 | rn << 3 | rd
}

fn lsls_imm(rd: u16, rm: u16, imm5: u16) -> u16 {
    imm5 << 6 | rm << 3 | rd
}

fn dp(op: u16, rdn: u16, rm: u16) -> u16 {
    // Data-processing register group (0x4000 family).
    op | rm << 3 | rdn
}

fn ldr_sp(rt: u16, words: u16) -> u16 {
    0x9800 | rt << 8 | words
}

fn str_sp(rt: u16, words: u16) -> u16 {
    0x9000 | rt << 8 | words
}

fn add_sp_addr(rd: u16, words: u16) -> u16 {
    0xA800 | rd << 8 | words
}

fn ldr_imm(rt: u16, rn: u16) -> u16 {
    0x6800 | rn << 3 | rt
}

fn str_imm(rt: u16, rn: u16) -> u16 {
    0x6000 | rn << 3 | rt
}

fn ldrb_imm(rt: u16, rn: u16) -> u16 {
    0x7800 | rn << 3 | rt
}

fn strb_imm(rt: u16, rn: u16) -> u16 {
    0x7000 | rn << 3 | rt
}

fn bcond(cond: u16, imm8: u16) -> u16 {
    0xD000 | cond << 8 | imm8
}

fn b_short(imm11: u16) -> u16 {
    0xE000 | imm11
}

fn pop_reg(r: u16) -> u16 {
    0xBC00 | 1 << r
}

/// The syscall names the compiler recognises and lowers to trampolines.
fn syscall_number(name: &str) -> Option<Sysnum> {
    Some(match name {
        "exit" => Sysnum::Exit,
        "yield" => Sysnum::Yield,
        "sleep" => Sysnum::Sleep,
        "time" => Sysnum::Time,
        "malloc" => Sysnum::Malloc,
        "free" => Sysnum::Free,
        "realloc" => Sysnum::Realloc,
        "open" => Sysnum::Open,
        "close" => Sysnum::Close,
        "read" => Sysnum::Read,
        "write" => Sysnum::Write,
        "seek" => Sysnum::Seek,
        "putchar" => Sysnum::Putchar,
        "getchar" => Sysnum::Getchar,
        "puts" => Sysnum::Puts,
        "gpio_init" => Sysnum::GpioInit,
        "gpio_dir" => Sysnum::GpioDir,
        "gpio_put" => Sysnum::GpioPut,
        "gpio_get" => Sysnum::GpioGet,
        "gpio_pulls" => Sysnum::GpioPulls,
        "pwm_init" => Sysnum::PwmInit,
        "pwm_set_wrap" => Sysnum::PwmSetWrap,
        "pwm_set_level" => Sysnum::PwmSetLevel,
        "pwm_enable" => Sysnum::PwmEnable,
        "adc_init" => Sysnum::AdcInit,
        "adc_select" => Sysnum::AdcSelect,
        "adc_read" => Sysnum::AdcRead,
        "adc_temp" => Sysnum::AdcTemp,
        "spi_init" => Sysnum::SpiInit,
        "spi_write" => Sysnum::SpiWrite,
        "spi_read" => Sysnum::SpiRead,
        "spi_transfer" => Sysnum::SpiTransfer,
        "i2c_init" => Sysnum::I2cInit,
        "i2c_write" => Sysnum::I2cWrite,
        "i2c_read" => Sysnum::I2cRead,
        _ => return None,
    })
}

struct Local {
    name: u32,
    ty: CType,
    /// Word offset from SP.
    slot: u16,
}

/// How an assignable expression is addressed.
enum Lvalue {
    Local { slot: u16, ty: CType },
    Global { sym: u32, ty: CType },
    /// Address must be computed into r0 by [`Gen::emit_addr`].
    Mem { addr: ExprId, ty: CType },
}

impl Lvalue {
    fn ty(&self) -> CType {
        match self {
            Lvalue::Local { ty, .. }
            | Lvalue::Global { ty, .. }
            | Lvalue::Mem { ty, .. } => *ty,
        }
    }
}

struct Gen<'a> {
    unit: &'a Unit,
    strtab: &'a StrTab,
    text: Vec<u8>,
    data: Vec<u8>,
    relocs: Vec<Reloc>,
    symbols: Vec<Symbol>,
    sym_index: FnvHashMap<String, u32>,
    globals: FnvHashMap<String, (u32, CType)>,
    str_count: u32,

    // Per-function state.
    locals: Vec<Local>,
    scopes: Vec<usize>,
    next_slot: u16,
    max_slot: u16,
    labels: Vec<Option<u32>>,
    patches: Vec<(u32, u32)>,
    loops: Vec<(u32, u32)>,
    pool: Vec<u32>,
    pool_sites: Vec<(u32, usize)>,
    epilogue: u32,
    /// Words currently pushed on the operand stack. Locals are addressed
    /// off SP, so every SP-relative access is biased by this.
    depth: u16,
}

/// Generates the object for one translation unit.
pub fn generate(unit: &Unit, strtab: &StrTab) -> Result<ObjectFile, Error> {
    let mut g = Gen {
        unit,
        strtab,
        text: Vec::new(),
        data: Vec::new(),
        relocs: Vec::new(),
        symbols: Vec::new(),
        sym_index: FnvHashMap::default(),
        globals: FnvHashMap::default(),
        str_count: 0,
        locals: Vec::new(),
        scopes: Vec::new(),
        next_slot: 0,
        max_slot: 0,
        labels: Vec::new(),
        patches: Vec::new(),
        loops: Vec::new(),
        pool: Vec::new(),
        pool_sites: Vec::new(),
        epilogue: 0,
        depth: 0,
    };
    for global in &unit.globals {
        g.global(global)?;
    }
    for func in &unit.funcs {
        g.function(func)?;
    }
    log::debug!(
        "generated {}B text, {}B data, {} relocs, {} symbols",
        g.text.len(),
        g.data.len(),
        g.relocs.len(),
        g.symbols.len()
    );
    Ok(ObjectFile {
        text: g.text,
        data: g.data,
        relocs: g.relocs,
        symbols: g.symbols,
    })
}

impl Gen<'_> {
    fn fail(&self, line: u16, message: String) -> Error {
        Error::Syntax(vec![Diag {
            line,
            col: 0,
            message,
        }])
    }

    fn nosys(&self, line: u16, what: &str) -> Error {
        Error::NoSys {
            line,
            what: what.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Emission primitives

    fn here(&self) -> u32 {
        self.text.len() as u32
    }

    fn emit16(&mut self, hw: u16) {
        self.text.extend_from_slice(&hw.to_le_bytes());
    }

    fn patch16(&mut self, off: u32, hw: u16) {
        self.text[off as usize..off as usize + 2]
            .copy_from_slice(&hw.to_le_bytes());
    }

    fn new_label(&mut self) -> u32 {
        self.labels.push(None);
        (self.labels.len() - 1) as u32
    }

    fn bind(&mut self, label: u32) {
        self.labels[label as usize] = Some(self.here());
    }

    /// Emits a placeholder B.W to `label`, patched when the function is
    /// committed.
    fn bw_to(&mut self, label: u32) {
        self.patches.push((self.here(), label));
        self.emit16(0xF000);
        self.emit16(0x9000);
    }

    /// `cmp r0, #0; bne +4; b.w label`, taken when r0 is zero. The
    /// conditional hop is fixed-size, so it can never leave range.
    fn branch_if_false(&mut self, label: u32) {
        self.emit16(cmp_imm0(0));
        self.emit16(bcond(NE, 1));
        self.bw_to(label);
    }

    fn branch_if_true(&mut self, label: u32) {
        self.emit16(cmp_imm0(0));
        self.emit16(bcond(EQ, 1));
        self.bw_to(label);
    }

    /// Materialises the last comparison as 0/1 in r0. Must follow a CMP
    /// directly: MOVS would clobber the flags, so the skip pattern reads
    /// them first.
    fn cmp_result(&mut self, cond: u16) {
        self.emit16(bcond(cond, 1));
        self.emit16(movs(0, 0));
        self.emit16(b_short(0));
        self.emit16(movs(0, 1));
    }

    /// Loads a constant into r0: MOVS for small values, MOVS+RSBS for
    /// small negatives, byte-wise synthesis otherwise.
    fn load_const(&mut self, v: u32) {
        let sv = v as i32;
        if (0..=255).contains(&sv) {
            self.emit16(movs(0, v as u16));
            return;
        }
        if (-128..=-1).contains(&sv) {
            self.emit16(movs(0, (-sv) as u16));
            self.emit16(RSBS_R0);
            return;
        }
        self.emit16(movs(0, (v >> 24) as u16 & 0xFF));
        for shift in [16u32, 8, 0] {
            self.emit16(lsls_imm(0, 0, 8));
            let byte = (v >> shift) & 0xFF;
            if byte != 0 {
                self.emit16(adds_imm8(0, byte as u16));
            }
        }
    }

    /// Emits a PC-relative load of `sym`'s address into r0 via the literal
    /// pool.
    fn load_sym_addr(&mut self, sym: u32) {
        let idx = self
            .pool
            .iter()
            .position(|&s| s == sym)
            .unwrap_or_else(|| {
                self.pool.push(sym);
                self.pool.len() - 1
            });
        self.pool_sites.push((self.here(), idx));
        self.emit16(0x4800); // ldr r0, [pc, #..]; offset patched at flush
    }

    /// The `push r7; movs r7, #n; svc 0; pop r7` sequence shared by named
    /// syscalls and the division support calls.
    fn trampoline(&mut self, num: Sysnum) {
        self.emit16(PUSH_R7);
        self.depth += 1;
        self.emit16(movs(7, num as u32 as u16));
        self.emit16(SVC0);
        self.emit16(POP_R7);
        self.depth -= 1;
        self.ensure_syscall_symbol(num);
    }

    fn push_r0(&mut self) {
        self.emit16(PUSH_R0);
        self.depth += 1;
    }

    fn pop_r1(&mut self) {
        self.emit16(POP_R1);
        self.depth -= 1;
    }

    fn pop_into(&mut self, r: u16) {
        self.emit16(pop_reg(r));
        self.depth -= 1;
    }

    /// SP-relative word offset of `slot` with the operand stack bias
    /// applied.
    fn slot_off(&self, slot: u16) -> Result<u16, Error> {
        let off = slot + self.depth;
        if off > 255 {
            return Err(Error::TooLarge("expression nests too deeply"));
        }
        Ok(off)
    }

    fn load_local(&mut self, rt: u16, slot: u16) -> Result<(), Error> {
        let off = self.slot_off(slot)?;
        self.emit16(ldr_sp(rt, off));
        Ok(())
    }

    fn store_local(&mut self, rt: u16, slot: u16) -> Result<(), Error> {
        let off = self.slot_off(slot)?;
        self.emit16(str_sp(rt, off));
        Ok(())
    }

    fn local_addr(&mut self, slot: u16) -> Result<(), Error> {
        let off = self.slot_off(slot)?;
        self.emit16(add_sp_addr(0, off));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Symbols

    fn intern_symbol(&mut self, name: &str, symbol: Symbol) -> u32 {
        let idx = self.symbols.len() as u32;
        self.symbols.push(symbol);
        self.sym_index.insert(name.to_string(), idx);
        idx
    }

    /// Index of `name`, creating an extern record on first reference.
    fn extern_symbol(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.sym_index.get(name) {
            return idx;
        }
        self.intern_symbol(
            name,
            Symbol::new(name, 0, Section::None, SymbolKind::Extern),
        )
    }

    /// Defines `name`, upgrading a forward-referenced extern in place.
    fn define_symbol(
        &mut self,
        name: &str,
        value: u32,
        section: Section,
        kind: SymbolKind,
        line: u16,
    ) -> Result<u32, Error> {
        if let Some(&idx) = self.sym_index.get(name) {
            let s = &mut self.symbols[idx as usize];
            if s.kind != SymbolKind::Extern {
                return Err(
                    self.fail(line, format!("multiple definition of {name}"))
                );
            }
            s.value = value;
            s.section = section;
            s.kind = kind;
            return Ok(idx);
        }
        Ok(self.intern_symbol(name, Symbol::new(name, value, section, kind)))
    }

    fn ensure_syscall_symbol(&mut self, num: Sysnum) {
        // The trampoline encodes the number inline; the symbol records the
        // dependency for inspection and for the loader's bookkeeping.
        let name = format!("sys.{}", num as u32);
        if !self.sym_index.contains_key(&name) {
            self.intern_symbol(
                &name,
                Symbol::new(
                    &name,
                    num as u32,
                    Section::None,
                    SymbolKind::Syscall,
                ),
            );
        }
    }

    // ------------------------------------------------------------------
    // Data section

    fn align_data(&mut self, align: usize) {
        while self.data.len() % align != 0 {
            self.data.push(0);
        }
    }

    /// Appends a string literal to DATA under a fresh local symbol and
    /// returns the symbol index.
    fn string_symbol(&mut self, offset: u32) -> u32 {
        let name = format!(".LC{}", self.str_count);
        self.str_count += 1;
        let at = self.data.len() as u32;
        self.data
            .extend_from_slice(self.strtab.get(offset).as_bytes());
        self.data.push(0);
        self.intern_symbol(
            &name,
            Symbol::new(&name, at, Section::Data, SymbolKind::Local),
        )
    }

    fn global(&mut self, g: &crate::ast::GlobalDef) -> Result<(), Error> {
        if g.ty.base == Base::Float {
            return Err(self.nosys(g.line, "floating-point data"));
        }
        let name = self.strtab.get(g.name).to_string();

        // A string initialiser's bytes go first, then the pointer cell
        // with a DATA_PTR relocation onto them.
        let str_sym = match g.init {
            Some(GlobalInit::Str(off)) => Some(self.string_symbol(off)),
            _ => None,
        };

        self.align_data(4);
        let at = self.data.len() as u32;
        let size = g.ty.size().max(1) as usize;
        match g.init {
            Some(GlobalInit::Const(v)) => {
                if g.ty.array.is_some() {
                    return Err(self.nosys(g.line, "array initialisers"));
                }
                let bytes = v.to_le_bytes();
                self.data.extend_from_slice(&bytes[..size.min(4)]);
                if size > 4 {
                    self.data.resize(at as usize + size, 0);
                }
            }
            Some(GlobalInit::Str(_)) => {
                let sym = str_sym.unwrap();
                self.relocs.push(Reloc {
                    offset: at,
                    section: Section::Data,
                    kind: RelocKind::DataPtr,
                    symbol: sym,
                });
                self.data.extend_from_slice(&[0; 4]);
            }
            None => {
                // Zero-initialised; the object format keeps these in DATA.
                self.data.resize(at as usize + size, 0);
            }
        }

        let kind = if g.is_static {
            SymbolKind::Local
        } else {
            SymbolKind::Global
        };
        let sym = self.define_symbol(&name, at, Section::Data, kind, g.line)?;
        self.globals.insert(name, (sym, g.ty));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions

    fn function(&mut self, f: &FuncDef) -> Result<(), Error> {
        if f.ret.base == Base::Float {
            return Err(self.nosys(f.line, "floating-point return"));
        }
        if f.params.len() > 4 {
            return Err(self.nosys(f.line, "more than four parameters"));
        }
        let name = self.strtab.get(f.name).to_string();
        let kind = if f.is_static {
            SymbolKind::Local
        } else {
            SymbolKind::Global
        };
        let start = self.here();
        self.define_symbol(&name, start, Section::Text, kind, f.line)?;

        // Reset per-function state.
        self.locals.clear();
        self.scopes.clear();
        self.next_slot = 0;
        self.max_slot = 0;
        self.labels.clear();
        self.patches.clear();
        self.loops.clear();
        self.pool.clear();
        self.pool_sites.clear();
        self.depth = 0;

        self.emit16(PUSH_CALLEE);
        let sub_site = self.here();
        self.emit16(0xB080); // sub sp, #area; patched below
        for (i, p) in f.params.iter().enumerate() {
            if p.ty.base == Base::Float && p.ty.ptr == 0 {
                return Err(self.nosys(f.line, "floating-point parameter"));
            }
            let slot = self.declare_local(p.name, p.ty, f.line)?;
            self.store_local(i as u16, slot)?;
        }
        self.epilogue = self.new_label();

        self.stmt(f.body)?;

        self.bind(self.epilogue);
        let add_site = self.here();
        self.emit16(0xB000); // add sp, #area; patched below
        self.emit16(POP_CALLEE);

        self.flush_pool(f.line)?;
        self.commit_branches(f.line)?;

        let words = self.max_slot;
        if words > 127 {
            return Err(Error::TooLarge("local area exceeds 508 bytes"));
        }
        self.patch16(sub_site, 0xB080 | words);
        self.patch16(add_site, 0xB000 | words);
        Ok(())
    }

    /// Emits the literal pool after the epilogue: 4-aligned u32 slots,
    /// each carrying an ABS32 relocation, with every recorded `ldr`
    /// back-patched to reach its slot.
    fn flush_pool(&mut self, line: u16) -> Result<(), Error> {
        if self.pool.is_empty() {
            return Ok(());
        }
        if self.here() % 4 != 0 {
            self.emit16(NOP);
        }
        let pool_start = self.here();
        for (i, &sym) in self.pool.iter().enumerate() {
            self.relocs.push(Reloc {
                offset: pool_start + 4 * i as u32,
                section: Section::Text,
                kind: RelocKind::Abs32,
                symbol: sym,
            });
            self.text.extend_from_slice(&[0; 4]);
        }
        for &(site, idx) in &self.pool_sites {
            let slot = pool_start + 4 * idx as u32;
            let base = (site + 4) & !3;
            let off = (slot - base) / 4;
            if off > 255 {
                return Err(Error::TooLarge(
                    "function too long for its literal pool",
                ));
            }
            let hw = 0x4800 | off as u16;
            self.text[site as usize..site as usize + 2]
                .copy_from_slice(&hw.to_le_bytes());
        }
        let _ = line;
        Ok(())
    }

    /// Patches every recorded B.W site; all labels are bound by now.
    fn commit_branches(&mut self, line: u16) -> Result<(), Error> {
        for &(site, label) in &self.patches {
            let target = self.labels[label as usize]
                .ok_or_else(|| self.fail(line, "unbound label".into()))?;
            let [hi, lo] = thumb::encode_bw(site, target)
                .ok_or(Error::TooLarge("branch out of range"))?;
            self.text[site as usize..site as usize + 2]
                .copy_from_slice(&hi.to_le_bytes());
            self.text[site as usize + 2..site as usize + 4]
                .copy_from_slice(&lo.to_le_bytes());
        }
        self.patches.clear();
        Ok(())
    }

    fn declare_local(
        &mut self,
        name: u32,
        ty: CType,
        line: u16,
    ) -> Result<u16, Error> {
        if ty.base == Base::Float && ty.ptr == 0 {
            return Err(self.nosys(line, "floating-point variables"));
        }
        let words = (ty.size().max(1) + 3) / 4;
        let slot = self.next_slot;
        self.next_slot += words as u16;
        self.max_slot = self.max_slot.max(self.next_slot);
        if self.next_slot > 127 {
            return Err(Error::TooLarge("local area exceeds 508 bytes"));
        }
        self.locals.push(Local { name, ty, slot });
        Ok(slot)
    }

    fn lookup_local(&self, name: u32) -> Option<&Local> {
        let target = self.strtab.get(name);
        self.locals
            .iter()
            .rev()
            .find(|l| self.strtab.get(l.name) == target)
    }

    // ------------------------------------------------------------------
    // Statements

    fn stmt(&mut self, id: StmtId) -> Result<(), Error> {
        let node = self.unit.ast.s(id);
        let line = node.line;
        match node.kind.clone() {
            Stmt::Empty => {}
            Stmt::Expr(e) => {
                self.expr(e)?;
            }
            Stmt::Decl { name, ty, init } => {
                let slot = self.declare_local(name, ty, line)?;
                if let Some(init) = init {
                    if ty.array.is_some() {
                        return Err(self.nosys(line, "array initialisers"));
                    }
                    self.expr(init)?;
                    self.store_local(0, slot)?;
                }
            }
            Stmt::Compound(body) => {
                self.scopes.push(self.locals.len());
                for s in body {
                    self.stmt(s)?;
                }
                let mark = self.scopes.pop().unwrap();
                self.locals.truncate(mark);
            }
            Stmt::If {
                cond,
                then_,
                else_,
            } => {
                let l_else = self.new_label();
                self.expr(cond)?;
                self.branch_if_false(l_else);
                self.stmt(then_)?;
                match else_ {
                    Some(else_) => {
                        let l_end = self.new_label();
                        self.bw_to(l_end);
                        self.bind(l_else);
                        self.stmt(else_)?;
                        self.bind(l_end);
                    }
                    None => self.bind(l_else),
                }
            }
            Stmt::While { cond, body } => {
                let l_top = self.new_label();
                let l_end = self.new_label();
                self.bind(l_top);
                self.expr(cond)?;
                self.branch_if_false(l_end);
                self.loops.push((l_end, l_top));
                self.stmt(body)?;
                self.loops.pop();
                self.bw_to(l_top);
                self.bind(l_end);
            }
            Stmt::DoWhile { body, cond } => {
                let l_top = self.new_label();
                let l_cont = self.new_label();
                let l_end = self.new_label();
                self.bind(l_top);
                self.loops.push((l_end, l_cont));
                self.stmt(body)?;
                self.loops.pop();
                self.bind(l_cont);
                self.expr(cond)?;
                self.branch_if_true(l_top);
                self.bind(l_end);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.scopes.push(self.locals.len());
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let l_top = self.new_label();
                let l_step = self.new_label();
                let l_end = self.new_label();
                self.bind(l_top);
                if let Some(cond) = cond {
                    self.expr(cond)?;
                    self.branch_if_false(l_end);
                }
                self.loops.push((l_end, l_step));
                self.stmt(body)?;
                self.loops.pop();
                self.bind(l_step);
                if let Some(step) = step {
                    self.expr(step)?;
                }
                self.bw_to(l_top);
                self.bind(l_end);
                let mark = self.scopes.pop().unwrap();
                self.locals.truncate(mark);
            }
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.expr(value)?;
                }
                self.bw_to(self.epilogue);
            }
            Stmt::Break => match self.loops.last().copied() {
                Some((l_end, _)) => self.bw_to(l_end),
                None => {
                    return Err(self.fail(line, "break outside a loop".into()))
                }
            },
            Stmt::Continue => match self.loops.last().copied() {
                Some((_, l_cont)) => self.bw_to(l_cont),
                None => {
                    return Err(
                        self.fail(line, "continue outside a loop".into())
                    )
                }
            },
            Stmt::Unsupported(what) => {
                return Err(self.nosys(line, what));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions

    /// Classifies an assignable expression. `Mem` variants defer address
    /// computation to [`Self::emit_addr`].
    fn lvalue(&mut self, id: ExprId) -> Result<Lvalue, Error> {
        let node = self.unit.ast.e(id);
        let line = node.line;
        match node.kind.clone() {
            Expr::Ident(name) => {
                if let Some(l) = self.lookup_local(name) {
                    if l.ty.array.is_some() {
                        return Err(self
                            .fail(line, "cannot assign to an array".into()));
                    }
                    return Ok(Lvalue::Local {
                        slot: l.slot,
                        ty: l.ty,
                    });
                }
                let n = self.strtab.get(name).to_string();
                if let Some(&(sym, ty)) = self.globals.get(&n) {
                    if ty.array.is_some() {
                        return Err(self
                            .fail(line, "cannot assign to an array".into()));
                    }
                    return Ok(Lvalue::Global { sym, ty });
                }
                Err(self.fail(line, format!("undeclared identifier {n}")))
            }
            Expr::Unary {
                op: UnOp::Deref,
                rhs,
            } => {
                let ty = self.type_of(rhs)?.deref();
                Ok(Lvalue::Mem { addr: id, ty })
            }
            Expr::Index { base, .. } => {
                let ty = self.type_of(base)?.deref();
                Ok(Lvalue::Mem { addr: id, ty })
            }
            _ => Err(self.fail(line, "expression is not assignable".into())),
        }
    }

    /// Emits the address of a `Mem` lvalue into r0.
    fn emit_addr(&mut self, id: ExprId) -> Result<(), Error> {
        let node = self.unit.ast.e(id);
        match node.kind.clone() {
            Expr::Unary {
                op: UnOp::Deref,
                rhs,
            } => {
                self.expr(rhs)?;
                Ok(())
            }
            Expr::Index { base, index } => {
                let bty = self.type_of(base)?;
                let scale = bty.deref().elem_size();
                self.expr(index)?;
                if scale == 4 {
                    self.emit16(lsls_imm(0, 0, 2));
                }
                self.push_r0();
                self.expr(base)?;
                self.pop_r1();
                self.emit16(adds3(0, 1, 0));
                Ok(())
            }
            _ => {
                let line = node.line;
                Err(self.fail(line, "expression is not addressable".into()))
            }
        }
    }

    /// Static type of an expression, without emitting code. Only the
    /// cases that can denote pointers matter; everything else is int.
    fn type_of(&mut self, id: ExprId) -> Result<CType, Error> {
        let node = self.unit.ast.e(id);
        Ok(match node.kind.clone() {
            Expr::Ident(name) => {
                if let Some(l) = self.lookup_local(name) {
                    l.ty
                } else {
                    let n = self.strtab.get(name).to_string();
                    match self.globals.get(&n) {
                        Some(&(_, ty)) => ty,
                        None => CType::INT,
                    }
                }
            }
            Expr::Str(_) => CType {
                base: Base::Char,
                ptr: 1,
                array: None,
            },
            Expr::Unary {
                op: UnOp::Addr,
                rhs,
            } => self.type_of(rhs)?.ptr_to(),
            Expr::Unary {
                op: UnOp::Deref,
                rhs,
            } => self.type_of(rhs)?.deref(),
            Expr::Index { base, .. } => self.type_of(base)?.deref(),
            Expr::Binary { op, lhs, rhs } => match op {
                BinOp::Add | BinOp::Sub => {
                    let lt = self.type_of(lhs)?;
                    if lt.is_pointerish() {
                        lt.decay()
                    } else {
                        let rt = self.type_of(rhs)?;
                        if rt.is_pointerish() {
                            rt.decay()
                        } else {
                            CType::INT
                        }
                    }
                }
                _ => CType::INT,
            },
            Expr::Assign { lhs, .. } => self.type_of(lhs)?,
            Expr::Ternary { then_, .. } => self.type_of(then_)?,
            Expr::Comma { rhs, .. } => self.type_of(rhs)?,
            _ => CType::INT,
        })
    }

    /// Stores r0 into an already-addressed location: `r1` holds the
    /// address, width chosen by `ty`.
    fn store_via_r1(&mut self, ty: CType) {
        if ty.is_byte() {
            self.emit16(strb_imm(0, 1));
        } else {
            self.emit16(str_imm(0, 1));
        }
    }

    /// Mirror image: the value is in r1 and the address in r0.
    fn store_r1_via_r0(&mut self, ty: CType) {
        if ty.is_byte() {
            self.emit16(strb_imm(1, 0));
        } else {
            self.emit16(str_imm(1, 0));
        }
    }

    fn load_via_r0(&mut self, ty: CType) {
        if ty.is_byte() {
            self.emit16(ldrb_imm(0, 0));
        } else {
            self.emit16(ldr_imm(0, 0));
        }
    }

    /// Applies `op` with the left operand in r1 and the right in r0,
    /// leaving the result in r0. Pointer scaling for `+`/`-` follows the
    /// operand types.
    fn apply_bin(
        &mut self,
        op: BinOp,
        lt: CType,
        rt: CType,
    ) -> Result<CType, Error> {
        match op {
            BinOp::Add => {
                if lt.is_pointerish() && !rt.is_pointerish() {
                    if lt.scale() == 4 {
                        self.emit16(lsls_imm(0, 0, 2));
                    }
                } else if rt.is_pointerish() && !lt.is_pointerish() {
                    if rt.scale() == 4 {
                        self.emit16(lsls_imm(1, 1, 2));
                    }
                }
                self.emit16(adds3(0, 1, 0));
            }
            BinOp::Sub => {
                if lt.is_pointerish() && !rt.is_pointerish() && lt.scale() == 4
                {
                    self.emit16(lsls_imm(0, 0, 2));
                }
                self.emit16(subs3(0, 1, 0));
            }
            BinOp::Mul => self.emit16(dp(0x4340, 0, 1)),
            BinOp::Div | BinOp::Mod => {
                // Operands into the r0/r1 argument slots, then the
                // division syscall.
                self.emit16(MOV_R2_R0);
                self.emit16(MOV_R0_R1);
                self.emit16(MOV_R1_R2);
                self.trampoline(if op == BinOp::Div {
                    Sysnum::Sdiv
                } else {
                    Sysnum::Smod
                });
            }
            BinOp::And => self.emit16(dp(0x4000, 0, 1)),
            BinOp::Xor => self.emit16(dp(0x4040, 0, 1)),
            BinOp::Or => self.emit16(dp(0x4300, 0, 1)),
            BinOp::Shl => {
                self.emit16(dp(0x4080, 1, 0));
                self.emit16(MOV_R0_R1);
            }
            BinOp::Shr => {
                self.emit16(dp(0x4100, 1, 0));
                self.emit16(MOV_R0_R1);
            }
            BinOp::Eq
            | BinOp::Ne
            | BinOp::Lt
            | BinOp::Le
            | BinOp::Gt
            | BinOp::Ge => {
                self.emit16(CMP_R1_R0);
                let cond = match op {
                    BinOp::Eq => EQ,
                    BinOp::Ne => NE,
                    BinOp::Lt => LT,
                    BinOp::Le => LE,
                    BinOp::Gt => GT,
                    _ => GE,
                };
                self.cmp_result(cond);
                return Ok(CType::INT);
            }
            BinOp::LogAnd | BinOp::LogOr => unreachable!("short-circuited"),
        }
        if matches!(op, BinOp::Add | BinOp::Sub) && lt.is_pointerish() {
            return Ok(lt.decay());
        }
        if op == BinOp::Add && rt.is_pointerish() {
            return Ok(rt.decay());
        }
        Ok(CType::INT)
    }

    /// Emits `id`, leaving its value in r0, and returns its static type.
    fn expr(&mut self, id: ExprId) -> Result<CType, Error> {
        let node = self.unit.ast.e(id);
        let line = node.line;
        match node.kind.clone() {
            Expr::Num(v) => {
                self.load_const(v);
                Ok(CType::INT)
            }
            Expr::Sizeof(v) => {
                self.load_const(v);
                Ok(CType::INT)
            }
            Expr::Str(off) => {
                let sym = self.string_symbol(off);
                self.load_sym_addr(sym);
                Ok(CType {
                    base: Base::Char,
                    ptr: 1,
                    array: None,
                })
            }
            Expr::Ident(name) => {
                if let Some(l) = self.lookup_local(name) {
                    let (slot, ty) = (l.slot, l.ty);
                    if ty.array.is_some() {
                        self.local_addr(slot)?;
                    } else {
                        self.load_local(0, slot)?;
                    }
                    return Ok(ty);
                }
                let n = self.strtab.get(name).to_string();
                if let Some(&(sym, ty)) = self.globals.get(&n) {
                    self.load_sym_addr(sym);
                    if ty.array.is_none() {
                        self.load_via_r0(ty);
                    }
                    return Ok(ty);
                }
                Err(self.fail(line, format!("undeclared identifier {n}")))
            }
            Expr::Unary { op, rhs } => self.unary(op, rhs, line),
            Expr::Binary { op, lhs, rhs } => {
                if op == BinOp::LogAnd || op == BinOp::LogOr {
                    return self.short_circuit(op, lhs, rhs);
                }
                let lt = self.expr(lhs)?;
                self.push_r0();
                let rt = self.expr(rhs)?;
                self.pop_r1();
                self.apply_bin(op, lt, rt)
            }
            Expr::Assign { op, lhs, rhs } => self.assign(op, lhs, rhs),
            Expr::Ternary {
                cond,
                then_,
                else_,
            } => {
                let l_else = self.new_label();
                let l_end = self.new_label();
                self.expr(cond)?;
                self.branch_if_false(l_else);
                let ty = self.expr(then_)?;
                self.bw_to(l_end);
                self.bind(l_else);
                self.expr(else_)?;
                self.bind(l_end);
                Ok(ty)
            }
            Expr::Comma { lhs, rhs } => {
                self.expr(lhs)?;
                self.expr(rhs)
            }
            Expr::Call { name, args } => self.call(name, &args, line),
            Expr::Index { base, index } => {
                let ty = self.type_of(base)?.deref();
                let _ = index;
                self.emit_addr(id)?;
                self.load_via_r0(ty);
                Ok(ty)
            }
            Expr::Postfix { dec, lhs } => self.incdec(lhs, dec, true, line),
            Expr::Unsupported(what) => Err(self.nosys(line, what)),
        }
    }

    fn unary(
        &mut self,
        op: UnOp,
        rhs: ExprId,
        line: u16,
    ) -> Result<CType, Error> {
        match op {
            UnOp::Neg => {
                self.expr(rhs)?;
                self.emit16(RSBS_R0);
                Ok(CType::INT)
            }
            UnOp::BitNot => {
                self.expr(rhs)?;
                self.emit16(MVNS_R0);
                Ok(CType::INT)
            }
            UnOp::Not => {
                self.expr(rhs)?;
                self.emit16(cmp_imm0(0));
                self.cmp_result(EQ);
                Ok(CType::INT)
            }
            UnOp::Deref => {
                let ty = self.expr(rhs)?.deref();
                self.load_via_r0(ty);
                Ok(ty)
            }
            UnOp::Addr => {
                let lv = self.lvalue_or_array(rhs)?;
                match lv {
                    Lvalue::Local { slot, ty } => {
                        self.local_addr(slot)?;
                        Ok(ty.ptr_to())
                    }
                    Lvalue::Global { sym, ty } => {
                        self.load_sym_addr(sym);
                        Ok(ty.ptr_to())
                    }
                    Lvalue::Mem { addr, ty } => {
                        self.emit_addr(addr)?;
                        Ok(ty.ptr_to())
                    }
                }
            }
            UnOp::PreInc => self.incdec(rhs, false, false, line),
            UnOp::PreDec => self.incdec(rhs, true, false, line),
        }
    }

    /// Like [`Self::lvalue`] but arrays are allowed (for `&arr`).
    fn lvalue_or_array(&mut self, id: ExprId) -> Result<Lvalue, Error> {
        let node = self.unit.ast.e(id);
        if let Expr::Ident(name) = node.kind.clone() {
            if let Some(l) = self.lookup_local(name) {
                return Ok(Lvalue::Local {
                    slot: l.slot,
                    ty: l.ty,
                });
            }
            let n = self.strtab.get(name).to_string();
            if let Some(&(sym, ty)) = self.globals.get(&n) {
                return Ok(Lvalue::Global { sym, ty });
            }
        }
        self.lvalue(id)
    }

    fn short_circuit(
        &mut self,
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
    ) -> Result<CType, Error> {
        let l_out = self.new_label();
        let l_end = self.new_label();
        let and = op == BinOp::LogAnd;
        self.expr(lhs)?;
        if and {
            self.branch_if_false(l_out);
        } else {
            self.branch_if_true(l_out);
        }
        self.expr(rhs)?;
        if and {
            self.branch_if_false(l_out);
            self.emit16(movs(0, 1));
        } else {
            self.branch_if_true(l_out);
            self.emit16(movs(0, 0));
        }
        self.bw_to(l_end);
        self.bind(l_out);
        self.emit16(movs(0, if and { 0 } else { 1 }));
        self.bind(l_end);
        Ok(CType::INT)
    }

    fn assign(
        &mut self,
        op: Option<BinOp>,
        lhs: ExprId,
        rhs: ExprId,
    ) -> Result<CType, Error> {
        let lv = self.lvalue(lhs)?;
        let ty = lv.ty();
        match (op, lv) {
            (None, Lvalue::Local { slot, .. }) => {
                self.expr(rhs)?;
                self.store_local(0, slot)?;
            }
            (None, Lvalue::Global { sym, .. }) => {
                self.expr(rhs)?;
                self.push_r0();
                self.load_sym_addr(sym);
                self.pop_r1();
                self.store_r1_via_r0(ty);
                self.emit16(MOV_R0_R1); // the value is the result
            }
            (None, Lvalue::Mem { addr, .. }) => {
                self.expr(rhs)?;
                self.push_r0();
                self.emit_addr(addr)?;
                self.pop_r1();
                self.store_r1_via_r0(ty);
                self.emit16(MOV_R0_R1);
            }
            (Some(op), Lvalue::Local { slot, .. }) => {
                self.load_local(0, slot)?;
                self.push_r0();
                let rt = self.expr(rhs)?;
                self.pop_r1();
                self.apply_bin(op, ty, rt)?;
                self.store_local(0, slot)?;
            }
            (Some(op), Lvalue::Global { sym, .. }) => {
                self.load_sym_addr(sym);
                self.push_r0();
                self.load_via_r0(ty);
                self.push_r0();
                let rt = self.expr(rhs)?;
                self.pop_r1();
                self.apply_bin(op, ty, rt)?;
                self.pop_r1();
                self.store_via_r1(ty);
            }
            (Some(op), Lvalue::Mem { addr, .. }) => {
                self.emit_addr(addr)?;
                self.push_r0();
                self.load_via_r0(ty);
                self.push_r0();
                let rt = self.expr(rhs)?;
                self.pop_r1();
                self.apply_bin(op, ty, rt)?;
                self.pop_r1();
                self.store_via_r1(ty);
            }
        }
        Ok(ty)
    }

    /// `++`/`--`, prefix and postfix, over any lvalue shape. Returns the
    /// old value for postfix and the new value for prefix.
    fn incdec(
        &mut self,
        target: ExprId,
        dec: bool,
        postfix: bool,
        line: u16,
    ) -> Result<CType, Error> {
        let lv = self.lvalue(target)?;
        let ty = lv.ty();
        let delta = if ty.is_pointerish() {
            ty.scale() as u16
        } else {
            1
        };
        let _ = line;
        match lv {
            Lvalue::Local { slot, .. } => {
                self.load_local(0, slot)?;
                if postfix {
                    self.emit16(adds_imm3(1, 0, 0)); // mov r1, r0 (flags ok)
                    self.bump(1, dec, delta);
                    self.store_local(1, slot)?;
                } else {
                    self.bump(0, dec, delta);
                    self.store_local(0, slot)?;
                }
            }
            Lvalue::Global { sym, .. } => {
                self.load_sym_addr(sym);
                self.push_r0();
                self.load_via_r0(ty);
                self.incdec_store(ty, dec, postfix, delta);
            }
            Lvalue::Mem { addr, .. } => {
                self.emit_addr(addr)?;
                self.push_r0();
                self.load_via_r0(ty);
                self.incdec_store(ty, dec, postfix, delta);
            }
        }
        Ok(ty)
    }

    /// Common tail for global/deref increments: r0 holds the loaded
    /// value, the address is on the stack.
    fn incdec_store(&mut self, ty: CType, dec: bool, postfix: bool, delta: u16) {
        if postfix {
            // r2 = new value, store r2, keep r0 = old.
            self.emit16(adds_imm3(2, 0, 0));
            self.bump(2, dec, delta);
            self.pop_r1();
            if ty.is_byte() {
                self.emit16(strb_imm(2, 1));
            } else {
                self.emit16(str_imm(2, 1));
            }
        } else {
            self.bump(0, dec, delta);
            self.pop_r1();
            self.store_via_r1(ty);
        }
    }

    fn bump(&mut self, rd: u16, dec: bool, delta: u16) {
        if dec {
            self.emit16(subs_imm8(rd, delta));
        } else {
            self.emit16(adds_imm8(rd, delta));
        }
    }

    fn call(
        &mut self,
        name: u32,
        args: &[ExprId],
        line: u16,
    ) -> Result<CType, Error> {
        if args.len() > 4 {
            return Err(self.nosys(line, "more than four call arguments"));
        }
        for &a in args {
            self.expr(a)?;
            self.push_r0();
        }
        for i in (0..args.len()).rev() {
            self.pop_into(i as u16);
        }
        let n = self.strtab.get(name).to_string();
        if let Some(num) = syscall_number(&n) {
            self.trampoline(num);
            return Ok(CType::INT);
        }
        let sym = self.extern_symbol(&n);
        self.relocs.push(Reloc {
            offset: self.here(),
            section: Section::Text,
            kind: RelocKind::ThumbCall,
            symbol: sym,
        });
        // BL placeholder; the loader writes the real displacement.
        self.emit16(0xF000);
        self.emit16(0xF800);
        Ok(CType::INT)
    }
}

impl CType {
    /// Array-of-T used as a value becomes pointer-to-T.
    fn decay(self) -> Self {
        if self.array.is_some() {
            Self {
                base: self.base,
                ptr: self.ptr + 1,
                array: None,
            }
        } else {
            self
        }
    }
}
