//! Asignación de registros por linear scan.
//!
//! Las instrucciones de una función se numeran en el orden en que
//! aparecen sus bloques. Los parámetros se consideran definidos en el
//! índice 0 y el resto de instrucciones se numeran desde 1. El
//! intervalo de vida de un registro virtual va de su primera aparición
//! a su último uso. Como la IR nunca mantiene registros vivos a través
//! de un salto hacia atrás, este orden lineal es suficiente.
//!
//! No hay spilling: si en algún punto hay más valores vivos que
//! registros en el banco, la asignación falla.

use super::{Codegen, CodegenError};
use crate::{
    arch::Register,
    ir::{Function, VReg},
    source::Located,
};

use std::collections::{BTreeMap, HashMap};

/// Resultado de la asignación para una función.
pub struct Allocation<R: Register> {
    regs: HashMap<VReg, R>,
    used: Vec<R>,
}

impl<R: Register> Allocation<R> {
    pub fn get(&self, vreg: VReg) -> Option<R> {
        self.regs.get(&vreg).copied()
    }

    /// Registros ocupados al menos una vez, en orden del banco.
    pub fn used(&self) -> &[R] {
        &self.used
    }
}

/// Intervalo de vida `[def, last]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Interval {
    vreg: VReg,
    def: usize,
    last: usize,
}

pub fn allocate<R: Register>(function: &Function) -> Codegen<Allocation<R>> {
    let available = R::FILE.len();

    // Último uso del valor que ocupa cada registro físico
    let mut slots: Vec<Option<usize>> = vec![None; available];
    let mut regs = HashMap::new();

    for interval in intervals(function) {
        let free = |slot: &Option<usize>| slot.map_or(true, |last| last < interval.def);

        let index = match function.pin(interval.vreg) {
            Some(pin) if slots.get(pin).map_or(false, free) => pin,
            Some(pin) => {
                let error = CodegenError::PinClash {
                    vreg: interval.vreg,
                    register: pin,
                };

                return Err(Located::at(error, function.location.clone()));
            }

            None => match slots.iter().position(free) {
                Some(index) => index,
                None => {
                    let error = CodegenError::RegisterExhaustion {
                        live: available + 1,
                        available,
                    };

                    return Err(Located::at(error, function.location.clone()));
                }
            },
        };

        slots[index] = Some(interval.last);
        regs.insert(interval.vreg, R::FILE[index]);

        log::trace!(
            "{}: {} in [{}, {}] => {:?}",
            function.name,
            interval.vreg,
            interval.def,
            interval.last,
            R::FILE[index]
        );
    }

    let used = R::FILE
        .iter()
        .copied()
        .filter(|reg| regs.values().any(|used| used == reg))
        .collect();

    log::debug!(
        "allocated {} virtual registers of `{}` into {} physical registers",
        regs.len(),
        function.name,
        slots.iter().filter(|slot| slot.is_some()).count()
    );

    Ok(Allocation { regs, used })
}

/// Intervalos de vida ordenados por definición.
fn intervals(function: &Function) -> Vec<Interval> {
    let mut ranges = BTreeMap::new();

    for &param in &function.params {
        ranges.insert(param, (0, 0));
    }

    let instructions = function
        .blocks
        .iter()
        .flat_map(|block| block.instructions.iter());

    for (index, instruction) in (1..).zip(instructions) {
        for vreg in instruction.uses().into_iter().chain(instruction.def()) {
            let (_, last) = ranges.entry(vreg).or_insert((index, index));
            *last = index;
        }
    }

    let mut intervals = ranges
        .into_iter()
        .map(|(vreg, (def, last))| Interval { vreg, def, last })
        .collect::<Vec<_>>();

    intervals.sort_by_key(|interval| (interval.def, interval.vreg));
    intervals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::BinOp,
        ir::{Block, BlockId, Instruction, Width},
        source::{Location, Source},
    };

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Pair {
        A,
        B,
    }

    impl Register for Pair {
        const FILE: &'static [Self] = &[Pair::A, Pair::B];
    }

    fn function(params: &[u32], instructions: Vec<Instruction>) -> Function {
        let params: Vec<_> = params.iter().copied().map(VReg).collect();
        let pins = params.iter().copied().zip(0..).collect();

        Function {
            name: "f".into(),
            params,
            blocks: vec![Block {
                id: BlockId(0),
                instructions,
            }],
            pins,
            stack_size: 0,
            is_static: false,
            location: Location::start(&Source::new("test.c", "")),
        }
    }

    fn imm(dst: u32) -> Instruction {
        Instruction::Imm {
            dst: VReg(dst),
            value: 1,
        }
    }

    fn add(dst: u32, lhs: u32, rhs: u32) -> Instruction {
        Instruction::Binary {
            op: BinOp::Add,
            width: Width::Qword,
            dst: VReg(dst),
            lhs: VReg(lhs),
            rhs: VReg(rhs),
        }
    }

    #[test]
    fn intervals_follow_instruction_order() {
        let f = function(&[0], vec![imm(1), add(2, 0, 1), Instruction::Return(Some(VReg(2)))]);

        let expected = vec![
            Interval { vreg: VReg(0), def: 0, last: 2 },
            Interval { vreg: VReg(1), def: 1, last: 2 },
            Interval { vreg: VReg(2), def: 2, last: 3 },
        ];

        assert_eq!(intervals(&f), expected);
    }

    fn store(addr: u32, src: u32) -> Instruction {
        Instruction::Store {
            width: Width::Qword,
            addr: VReg(addr),
            src: VReg(src),
        }
    }

    #[test]
    fn overlapping_values_never_share() {
        let f = function(&[], vec![imm(0), imm(1), store(0, 1), Instruction::Return(None)]);
        let allocation = allocate::<Pair>(&f).unwrap();

        assert!(allocation.get(VReg(0)).is_some());
        assert_ne!(allocation.get(VReg(0)), allocation.get(VReg(1)));
    }

    #[test]
    fn operands_stay_live_through_their_last_use() {
        // %2 nace donde %0 y %1 se usan por última vez
        let f = function(&[], vec![imm(0), imm(1), add(2, 0, 1), Instruction::Return(Some(VReg(2)))]);
        assert!(allocate::<Pair>(&f).is_err());
    }

    #[test]
    fn dead_values_free_registers() {
        let f = function(
            &[],
            vec![
                imm(0),
                Instruction::Return(Some(VReg(0))),
                imm(1),
                imm(2),
                store(1, 2),
                Instruction::Return(None),
            ],
        );

        let allocation = allocate::<Pair>(&f).unwrap();
        assert_eq!(allocation.get(VReg(0)), Some(Pair::A));
        assert_eq!(allocation.get(VReg(1)), Some(Pair::A));
        assert_eq!(allocation.get(VReg(2)), Some(Pair::B));
        assert_eq!(allocation.used(), &[Pair::A, Pair::B]);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let f = function(&[], vec![imm(0), imm(1), imm(2), add(3, 0, 1), add(4, 3, 2)]);
        let error = allocate::<Pair>(&f).err().unwrap();

        assert!(matches!(
            error.val(),
            CodegenError::RegisterExhaustion { available: 2, .. }
        ));
    }

    #[test]
    fn params_take_pinned_registers() {
        let f = function(&[0, 1], vec![add(2, 1, 0), Instruction::Return(Some(VReg(2)))]);
        let allocation = allocate::<Pair>(&f);

        // %2 nace donde mueren ambos parámetros, pero no hay un tercer registro
        assert!(allocation.is_err());

        let f = function(&[0, 1], vec![Instruction::Return(Some(VReg(1)))]);
        let allocation = allocate::<Pair>(&f).unwrap();

        assert_eq!(allocation.get(VReg(0)), Some(Pair::A));
        assert_eq!(allocation.get(VReg(1)), Some(Pair::B));
    }

    #[test]
    fn pin_clash() {
        let mut f = function(&[0], vec![imm(1), add(2, 0, 1), Instruction::Return(Some(VReg(2)))]);
        f.pins = vec![(VReg(0), 0), (VReg(1), 0)];

        let error = allocate::<Pair>(&f).err().unwrap();
        assert!(matches!(error.val(), CodegenError::PinClash { register: 0, .. }));
    }
}
