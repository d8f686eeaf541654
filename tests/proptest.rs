//! Property-based tests using proptest.

use iced_x86::{Decoder, DecoderOptions};
use proptest::prelude::*;
use weft::{Assembler, Error, JumpDistance, Label, Operand, Register, ScaleFactor};

// ── Strategies ──────────────────────────────────────────────────────────

fn arb_register() -> impl Strategy<Value = Register> {
    prop::sample::select(Register::ALL.to_vec())
}

fn arb_index() -> impl Strategy<Value = Register> {
    arb_register().prop_filter("RSP cannot be an index", |r| *r != Register::RSP)
}

fn arb_scale() -> impl Strategy<Value = ScaleFactor> {
    prop::sample::select(ScaleFactor::ALL.to_vec())
}

fn arb_disp() -> impl Strategy<Value = i32> {
    prop_oneof![Just(0), -128i32..128, any::<i32>()]
}

#[derive(Debug, Clone)]
enum Insn {
    MovImm(Register, i64),
    AddRr(Register, Register),
    AddRm(Register, Register, i32),
    AddMi(Register, Register, ScaleFactor, i32, i64),
    Ret,
}

fn arb_insn() -> impl Strategy<Value = Insn> {
    prop_oneof![
        (arb_register(), any::<i64>()).prop_map(|(r, i)| Insn::MovImm(r, i)),
        (arb_register(), arb_register()).prop_map(|(d, s)| Insn::AddRr(d, s)),
        (arb_register(), arb_register(), arb_disp()).prop_map(|(d, b, x)| Insn::AddRm(d, b, x)),
        (
            arb_register().prop_filter("scratch", |r| *r != Register::R11),
            arb_index().prop_filter("scratch", |r| *r != Register::R11),
            arb_scale(),
            arb_disp(),
            any::<i64>()
        )
            .prop_map(|(b, i, s, d, imm)| Insn::AddMi(b, i, s, d, imm)),
        Just(Insn::Ret),
    ]
}

fn emit(asm: &mut Assembler, insn: &Insn) -> weft::Result<()> {
    match *insn {
        Insn::MovImm(dst, imm) => asm.emit_mov_imm64(dst, imm),
        Insn::AddRr(dst, src) => asm.emit_add_rr(dst, src),
        Insn::AddRm(dst, base, disp) => asm.emit_add_rm(dst, &Operand::base_disp(base, disp)),
        Insn::AddMi(base, index, scale, disp, imm) => {
            let addr = Operand::base_index_scaled(base, index, scale, disp)?;
            asm.emit_add_mi(&addr, imm)
        }
        Insn::Ret => asm.emit_ret(),
    }
}

// ── Properties ──────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn indexed_address_round_trips(
        base in arb_register(),
        index in arb_index(),
        scale in arb_scale(),
        disp in arb_disp(),
    ) {
        let op = Operand::base_index_scaled(base, index, scale, disp).unwrap();
        prop_assert!((2..=6).contains(&op.len()));
        prop_assert_eq!(op.base(), Some(base));
        prop_assert_eq!(op.index(), Some(index));
        prop_assert_eq!(op.scale(), Some(scale));
        prop_assert_eq!(op.displacement(), disp);

        let mut asm = Assembler::new();
        asm.emit_add_rm(Register::RAX, &op).unwrap();
        prop_assert_eq!(asm.size(), 2 + op.len());
        let mut decoder = Decoder::with_ip(64, asm.code(), 0, DecoderOptions::NONE);
        let insn = decoder.decode();
        prop_assert!(!insn.is_invalid());
        prop_assert_eq!(insn.len(), asm.size());
        prop_assert_eq!(insn.memory_index_scale(), scale.value());
        prop_assert_eq!(insn.memory_displacement64() as i64, disp as i64);
    }

    #[test]
    fn base_address_round_trips(base in arb_register(), disp in arb_disp()) {
        for op in [Operand::base_disp(base, disp), Operand::base_disp32(base, disp)] {
            prop_assert!((1..=6).contains(&op.len()));
            prop_assert_eq!(op.base(), Some(base));
            prop_assert_eq!(op.index(), None);
            prop_assert_eq!(op.displacement(), disp);
        }
    }

    #[test]
    fn emission_never_crosses_capacity(
        max in 0usize..96,
        insns in prop::collection::vec(arb_insn(), 0..32),
    ) {
        let mut asm = Assembler::builder()
            .initial_capacity(max / 2)
            .max_capacity(max)
            .build()
            .unwrap();
        for insn in &insns {
            let before = asm.size();
            match emit(&mut asm, insn) {
                Ok(()) => prop_assert!(asm.size() > before),
                Err(Error::BufferOverflow { .. }) => prop_assert_eq!(asm.size(), before),
                Err(err) => prop_assert!(false, "unexpected error: {}", err),
            }
            prop_assert!(asm.size() <= max);
        }
    }

    #[test]
    fn bind_patches_every_pending_site(gaps in prop::collection::vec(0usize..8, 1..24)) {
        let mut asm = Assembler::new();
        let mut label = Label::new();
        let mut sites = Vec::new();
        for gap in &gaps {
            for _ in 0..*gap {
                asm.emit_ret().unwrap();
            }
            sites.push(asm.size() + 1);
            asm.emit_jmp(&mut label, JumpDistance::Near).unwrap();
        }
        prop_assert_eq!(asm.unresolved_labels(), 1);
        asm.bind(&mut label).unwrap();
        prop_assert_eq!(asm.unresolved_labels(), 0);

        let bound = label.position().unwrap();
        let code = asm.code();
        for site in sites {
            let value = i32::from_le_bytes([
                code[site],
                code[site + 1],
                code[site + 2],
                code[site + 3],
            ]);
            prop_assert_eq!(value as i64, bound as i64 - (site as i64 + 4));
        }
    }
}
