//! CPU execution engine.
//!
//! Implements the fetch/decode/execute cycle: half-word instruction
//! packing, the one-shot C address modifier, stack-mode detection, and
//! the memory-transfer, index-register and control-transfer instructions.
//! The arithmetic and logical instructions live in [`super::alu`].
//!
//! No error escapes `step()`: addressing faults are absorbed by the bus
//! layer and an unimplemented opcode halts the machine with a diagnostic.

use crate::asm::disassemble;
use crate::bus::{Bus, Device, MemRegion, Memory};
use crate::cpu::decode::{op, Instr};
use crate::word::{Word, MASK15, MASK24};
use serde::{Deserialize, Serialize};

/// 15-bit address arithmetic.
#[inline]
pub(crate) fn wrap15(v: u16) -> u16 {
    v & MASK15 as u16
}

/// Outcome of a STOP instruction, recognized from the magic operand
/// pairs used by the test programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCode {
    /// STOP 12345(6)
    Success,
    /// STOP 76543(2)
    Failure,
    /// Any other STOP
    Neutral,
}

/// CPU execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuState {
    /// Not started, or reset.
    Idle,
    /// Executing instructions.
    Running,
    /// A STOP instruction was executed.
    Halted(StopCode),
    /// An unimplemented opcode was encountered.
    Faulted,
}

/// The MESM-6 CPU with its instruction and data buses.
#[derive(Clone, Serialize, Deserialize)]
pub struct Cpu {
    /// Instruction address, 15 bits.
    pub pc: u16,
    /// Accumulator.
    pub acc: Word,
    /// Least-significant-bits register.
    pub rmr: Word,
    /// Index registers. M\[0\] is hardwired to zero, M\[15\] doubles as
    /// the stack pointer.
    pub m: [u16; 16],
    /// Mode and flag register, 7 bits.
    pub rr: u16,
    /// Right half of the cached instruction word is pending.
    pub right: bool,
    /// Execution state, checked between cycles.
    pub state: CpuState,
    /// Dump machine state on every cycle.
    pub trace: bool,
    /// Instructions executed since reset.
    pub cycles: u64,
    /// Instruction bus.
    pub ibus: Bus,
    /// Data bus.
    pub dbus: Bus,

    pc_next: u16,
    ir_cache: Word,
    ir: Word,
    pub(crate) ir_op: u16,
    pub(crate) ir_ind: u16,
    pub(crate) ir_addr: u16,
    pub(crate) v_addr: u16,
    pub(crate) stack: bool,
    c_active: bool,
    c_reg: u16,
}

/// An instruction handler mutates the CPU in place.
type Handler = fn(&mut Cpu);

/// Opcode dispatch: 256 slots covering the unified short/long opcode
/// space; empty slots are unimplemented instructions.
static DISPATCH: [Option<Handler>; 256] = dispatch_table();

const fn dispatch_table() -> [Option<Handler>; 256] {
    let mut t: [Option<Handler>; 256] = [None; 256];
    t[op::ATX as usize] = Some(Cpu::atx);
    t[op::STX as usize] = Some(Cpu::stx);
    t[op::XTS as usize] = Some(Cpu::xts);
    t[op::ADD as usize] = Some(Cpu::add);
    t[op::SUB as usize] = Some(Cpu::sub);
    t[op::RSUB as usize] = Some(Cpu::rsub);
    t[op::XTA as usize] = Some(Cpu::xta);
    t[op::AAX as usize] = Some(Cpu::aax);
    t[op::AEX as usize] = Some(Cpu::aex);
    t[op::ARX as usize] = Some(Cpu::arx);
    t[op::AOX as usize] = Some(Cpu::aox);
    t[op::APX as usize] = Some(Cpu::apx);
    t[op::AUX as usize] = Some(Cpu::aux);
    t[op::ACX as usize] = Some(Cpu::acx);
    t[op::ANX as usize] = Some(Cpu::anx);
    t[op::ASX as usize] = Some(Cpu::asx);
    t[op::XTR as usize] = Some(Cpu::xtr);
    t[op::RTE as usize] = Some(Cpu::rte);
    t[op::YTA as usize] = Some(Cpu::yta);
    t[op::ASN as usize] = Some(Cpu::asn);
    t[op::NTR as usize] = Some(Cpu::ntr);
    t[op::ATI as usize] = Some(Cpu::ati);
    t[op::ITA as usize] = Some(Cpu::ita);
    t[op::JADDM as usize] = Some(Cpu::jaddm);
    t[op::UTC as usize] = Some(Cpu::utc);
    t[op::WTC as usize] = Some(Cpu::wtc);
    t[op::VTM as usize] = Some(Cpu::vtm);
    t[op::UTM as usize] = Some(Cpu::utm);
    t[op::UZA as usize] = Some(Cpu::uza);
    t[op::UIA as usize] = Some(Cpu::uia);
    t[op::UJ as usize] = Some(Cpu::uj);
    t[op::VJM as usize] = Some(Cpu::vjm);
    t[op::VIM as usize] = Some(Cpu::vim);
    t[op::STOP as usize] = Some(Cpu::stop);
    t
}

impl Cpu {
    /// Create a CPU with empty buses.
    pub fn new() -> Self {
        Self {
            pc: 1,
            acc: 0,
            rmr: 0,
            m: [0; 16],
            rr: 0,
            right: false,
            state: CpuState::Idle,
            trace: false,
            cycles: 0,
            ibus: Bus::new("IBUS"),
            dbus: Bus::new("DBUS"),
            pc_next: 0,
            ir_cache: 0,
            ir: 0,
            ir_op: 0,
            ir_ind: 0,
            ir_addr: 0,
            v_addr: 0,
            stack: false,
            c_active: false,
            c_reg: 0,
        }
    }

    /// Create a CPU with the default run configuration: 1K of ROM at
    /// \[0, 1023\] on the instruction bus and 1K of RAM at
    /// \[0o2000, 0o3777\] on the data bus.
    pub fn with_default_memory() -> Self {
        let mut cpu = Self::new();
        cpu.ibus.attach(
            MemRegion::new(0, 1023),
            Device::Memory(Memory::new("ROM", 1024)),
        );
        cpu.dbus.attach(
            MemRegion::new(0o2000, 0o2000 + 1023),
            Device::Memory(Memory::new("RAM", 1024)),
        );
        cpu
    }

    /// Reset the machine: architectural state cleared, PC at 1, all
    /// device vectors zeroed.
    pub fn reset(&mut self) {
        self.pc = 1;
        self.acc = 0;
        self.rmr = 0;
        self.m = [0; 16];
        self.rr = 0;
        self.right = false;
        self.state = CpuState::Idle;
        self.cycles = 0;
        self.pc_next = 0;
        self.ir_cache = 0;
        self.ir = 0;
        self.ir_op = 0;
        self.ir_ind = 0;
        self.ir_addr = 0;
        self.v_addr = 0;
        self.stack = false;
        self.c_active = false;
        self.c_reg = 0;
        self.ibus.reset();
        self.dbus.reset();
    }

    pub fn is_running(&self) -> bool {
        self.state == CpuState::Running
    }

    /// The stop code of a halted machine, if it halted through STOP.
    pub fn stop_code(&self) -> Option<StopCode> {
        match self.state {
            CpuState::Halted(code) => Some(code),
            _ => None,
        }
    }

    /// Effective address: index register plus modified literal address.
    #[inline]
    pub(crate) fn u_addr(&self) -> u16 {
        wrap15(self.m[self.ir_ind as usize].wrapping_add(self.v_addr))
    }

    /// Pre-decrement the stack pointer for a stack-flavored operand read.
    pub(crate) fn pop_if_stack(&mut self) {
        if self.stack {
            self.m[15] = wrap15(self.m[15].wrapping_sub(1));
        }
    }

    // Last-result group tags, examined by the conditional branches.

    pub(crate) fn set_r_log(&mut self) {
        self.rr = self.rr & 0b11100011 | 0b0000100;
    }

    pub(crate) fn set_r_mul(&mut self) {
        self.rr = self.rr & 0b11100011 | 0b0001000;
    }

    pub(crate) fn set_r_add(&mut self) {
        self.rr = self.rr & 0b11100011 | 0b0010000;
    }

    pub fn is_r_log(&self) -> bool {
        self.rr & 0b11100 == 0b100
    }

    /// "Accumulator is zero" under the current last-result group.
    ///
    /// The additive group tests the mantissa sign, the multiplicative
    /// group the top word bit, the logical group the whole word. The bit
    /// tests and their precedence reproduce the hardware.
    pub fn acc_is_zero(&self) -> bool {
        if self.rr & 0b10000 != 0 && (self.acc >> 40) & 1 == 0 {
            // additive group: non-negative
            return true;
        }
        if self.rr & 0b11000 == 0b01000 && (self.acc >> 47) & 1 != 0 {
            return true;
        }
        if self.rr & 0b11100 == 0b00100 && self.acc == 0 {
            return true;
        }
        false
    }

    /// Execute one instruction. Does nothing unless the CPU is running.
    pub fn step(&mut self) {
        if self.state != CpuState::Running {
            return;
        }
        // FETCH from the cached word or the instruction bus
        self.ir = self.ir_cache & MASK24;
        self.pc_next = self.pc;
        if !self.right {
            self.ir_cache = self.ibus.read(self.pc);
            self.ir = self.ir_cache >> 24;
        } else {
            self.pc_next = wrap15(self.pc + 1);
        }
        self.right = !self.right;
        // DECODE and apply the one-shot C modifier
        let instr = Instr::unpack(self.ir);
        self.ir_op = instr.op;
        self.ir_ind = instr.ind;
        self.ir_addr = instr.addr;
        self.v_addr = if self.c_active {
            wrap15(self.ir_addr.wrapping_add(self.c_reg))
        } else {
            self.ir_addr
        };
        self.c_active = false;
        // stack mode: index 15 with zero address, or the STI quirk
        self.stack = self.ir_ind == 15
            && (self.v_addr == 0 || (self.ir_op == op::STI && self.u_addr() == 15));
        if self.trace {
            self.log_state();
        }
        // EXECUTE
        match DISPATCH[self.ir_op as usize] {
            Some(handler) => handler(self),
            None => {
                log::error!(
                    "unimplemented opcode {:03o}: {}",
                    self.ir_op,
                    disassemble(self.ir)
                );
                self.state = CpuState::Faulted;
            }
        }
        // advance the instruction pointer
        self.pc = self.pc_next;
        self.cycles += 1;
    }

    /// Run until halt or fault. Returns the number of instructions
    /// executed.
    pub fn run(&mut self) -> u64 {
        self.state = CpuState::Running;
        let start = self.cycles;
        while self.is_running() {
            self.step();
        }
        self.cycles - start
    }

    /// Run for at most `max_cycles` instructions.
    pub fn run_limited(&mut self, max_cycles: u64) -> u64 {
        self.state = CpuState::Running;
        let start = self.cycles;
        let limit = self.cycles + max_cycles;
        while self.is_running() && self.cycles < limit {
            self.step();
        }
        self.cycles - start
    }

    fn log_state(&self) {
        let half = if self.right { "L" } else { "R" };
        log::trace!(
            "PC {:05o}{} IR {:08o} {}",
            self.pc,
            half,
            self.ir,
            disassemble(self.ir)
        );
        log::trace!(
            "ACC {:016o} RMR {:016o} RR {:07b}",
            self.acc,
            self.rmr,
            self.rr
        );
        let m: Vec<String> = self.m.iter().map(|r| format!("{:05o}", r)).collect();
        log::trace!("M {}", m.join(" "));
    }

    // ==================== Memory transfer & stack ====================

    /// ATX: store ACC; stack mode pushes.
    fn atx(&mut self) {
        self.dbus.write(self.u_addr(), self.acc);
        if self.stack {
            self.m[15] = wrap15(self.m[15].wrapping_add(1));
        }
    }

    /// STX: store ACC, then pop a new ACC from the stack.
    fn stx(&mut self) {
        self.dbus.write(self.u_addr(), self.acc);
        self.m[15] = wrap15(self.m[15].wrapping_sub(1));
        self.acc = self.dbus.read(self.m[15]);
        self.set_r_log();
    }

    /// XTS: push ACC, then load from the effective address.
    fn xts(&mut self) {
        self.dbus.write(self.m[15], self.acc);
        self.m[15] = wrap15(self.m[15].wrapping_add(1));
        self.acc = self.dbus.read(self.u_addr());
        self.set_r_log();
    }

    /// XTA: load ACC.
    fn xta(&mut self) {
        self.pop_if_stack();
        self.acc = self.dbus.read(self.u_addr());
        self.set_r_log();
    }

    // ==================== Index registers ====================

    /// ITA: ACC := M\[uAddr mod 16\].
    fn ita(&mut self) {
        self.acc = self.m[(self.u_addr() & 0xF) as usize] as Word;
        self.set_r_log();
    }

    /// ATI: M\[uAddr mod 16\] := low 15 bits of ACC.
    fn ati(&mut self) {
        let t = (self.u_addr() & 0xF) as usize;
        if t != 0 {
            self.m[t] = (self.acc & MASK15) as u16;
        }
    }

    /// VTM: M\[ind\] := vAddr.
    fn vtm(&mut self) {
        if self.ir_ind != 0 {
            self.m[self.ir_ind as usize] = self.v_addr;
        }
    }

    /// UTM: M\[ind\] := uAddr.
    fn utm(&mut self) {
        if self.ir_ind != 0 {
            self.m[self.ir_ind as usize] = self.u_addr();
        }
    }

    /// JADDM: M\[vAddr mod 16\] += M\[ind\].
    fn jaddm(&mut self) {
        let t = (self.v_addr & 0xF) as usize;
        if t != 0 {
            self.m[t] = wrap15(self.m[t].wrapping_add(self.m[self.ir_ind as usize]));
        }
    }

    // ==================== Control transfer ====================

    /// VJM: call; the return address lands in M\[ind\].
    fn vjm(&mut self) {
        if self.ir_ind != 0 {
            self.m[self.ir_ind as usize] = wrap15(self.pc + 1);
        }
        self.pc_next = self.v_addr;
        self.right = false;
    }

    /// VIM: branch if M\[ind\] is nonzero.
    fn vim(&mut self) {
        if self.m[self.ir_ind as usize] != 0 {
            self.pc_next = self.v_addr;
            self.right = false;
        }
    }

    /// UJ: unconditional branch.
    fn uj(&mut self) {
        self.pc_next = self.u_addr();
        self.right = false;
    }

    /// UZA: branch if the accumulator tests zero for its group.
    fn uza(&mut self) {
        if self.acc_is_zero() {
            self.pc_next = self.u_addr();
            self.right = false;
        }
        self.rmr = self.acc;
    }

    /// UIA: branch if the accumulator tests nonzero for its group.
    fn uia(&mut self) {
        if !self.acc_is_zero() {
            self.pc_next = self.u_addr();
            self.right = false;
        }
        self.rmr = self.acc;
    }

    // ==================== Modes & modifiers ====================

    /// UTC: arm the C modifier with the effective address.
    fn utc(&mut self) {
        self.c_active = true;
        self.c_reg = self.u_addr();
    }

    /// WTC: arm the C modifier from memory.
    fn wtc(&mut self) {
        self.pop_if_stack();
        self.c_active = true;
        self.c_reg = (self.dbus.read(self.u_addr()) & MASK15) as u16;
    }

    /// NTR: set the RR mode bits from the effective address.
    ///
    /// Bit 6 is the in-interrupt flag and survives the update.
    fn ntr(&mut self) {
        self.rr = (self.rr & 0b1000000) | (self.u_addr() & 0b111111);
    }

    /// XTR: set the RR mode bits from memory, preserving bit 6.
    fn xtr(&mut self) {
        self.pop_if_stack();
        self.rr = (self.rr & 0b1000000) | (self.dbus.read(self.u_addr()) & 0o77) as u16;
    }

    /// RTE: read the RR mode bits into ACC.
    fn rte(&mut self) {
        self.acc = (self.rr & 0o77) as Word;
    }

    /// STOP: halt, recognizing the magic success/failure operands.
    fn stop(&mut self) {
        let code = match (self.ir_ind, self.ir_addr) {
            (6, 0o12345) => {
                log::info!("SUCCESS STOP");
                StopCode::Success
            }
            (2, 0o76543) => {
                log::info!("FAILED STOP");
                StopCode::Failure
            }
            _ => StopCode::Neutral,
        };
        self.state = CpuState::Halted(code);
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("state", &self.state)
            .field("pc", &self.pc)
            .field("acc", &self.acc)
            .field("rmr", &self.rmr)
            .field("m", &self.m)
            .field("rr", &self.rr)
            .field("cycles", &self.cycles)
            .finish()
    }
}
