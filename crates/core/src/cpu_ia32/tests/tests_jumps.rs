//! Tests for jumps, calls, returns and condition codes

use super::{load, test_cpu};
use crate::cpu_ia32::{FLAG_CF, FLAG_OF, FLAG_SF, FLAG_ZF};

#[test]
fn test_jmp_short_forward() {
    let mut cpu = test_cpu();

    // EB 02 = JMP +2 (skips the two NOPs)
    load(&mut cpu, 0x100, &[0xEB, 0x02, 0x90, 0x90, 0x90]);
    cpu.step().unwrap();

    assert_eq!(cpu.eip, 0x104);
}

#[test]
fn test_jmp_short_backward() {
    let mut cpu = test_cpu();

    // EB FE = JMP -2 (jump to itself)
    load(&mut cpu, 0x100, &[0xEB, 0xFE]);
    cpu.step().unwrap();

    assert_eq!(cpu.eip, 0x100, "negative rel8 sign-extends");
}

#[test]
fn test_jmp_near_rel32() {
    let mut cpu = test_cpu();

    // E9 00 01 00 00 = JMP +0x100
    load(&mut cpu, 0x100, &[0xE9, 0x00, 0x01, 0x00, 0x00]);
    cpu.step().unwrap();

    assert_eq!(cpu.eip, 0x205, "relative to the next instruction");
}

#[test]
fn test_jmp_rm32_absolute() {
    let mut cpu = test_cpu();

    // FF E3 = JMP EBX
    load(&mut cpu, 0x100, &[0xFF, 0xE3]);
    cpu.ebx = 0x1234;
    cpu.step().unwrap();

    assert_eq!(cpu.eip, 0x1234);
}

#[test]
fn test_jz_taken_and_not_taken() {
    let mut cpu = test_cpu();

    // 74 05 = JZ +5
    load(&mut cpu, 0x100, &[0x74, 0x05]);
    cpu.set_flag(FLAG_ZF, true);
    cpu.step().unwrap();
    assert_eq!(cpu.eip, 0x107, "taken when ZF=1");

    load(&mut cpu, 0x200, &[0x74, 0x05]);
    cpu.set_flag(FLAG_ZF, false);
    cpu.step().unwrap();
    assert_eq!(cpu.eip, 0x202, "fall through when ZF=0");
}

#[test]
fn test_all_sixteen_condition_codes() {
    // For each cc, build a flag state where it is taken and one where not
    struct Case {
        cc: u8,
        flags_taken: u32,
        flags_not: u32,
    }
    let cases = [
        Case { cc: 0x0, flags_taken: FLAG_OF, flags_not: 0 },               // O
        Case { cc: 0x1, flags_taken: 0, flags_not: FLAG_OF },               // NO
        Case { cc: 0x2, flags_taken: FLAG_CF, flags_not: 0 },               // B
        Case { cc: 0x3, flags_taken: 0, flags_not: FLAG_CF },               // NB
        Case { cc: 0x4, flags_taken: FLAG_ZF, flags_not: 0 },               // E
        Case { cc: 0x5, flags_taken: 0, flags_not: FLAG_ZF },               // NE
        Case { cc: 0x6, flags_taken: FLAG_CF, flags_not: 0 },               // BE
        Case { cc: 0x7, flags_taken: 0, flags_not: FLAG_ZF },               // NBE
        Case { cc: 0x8, flags_taken: FLAG_SF, flags_not: 0 },               // S
        Case { cc: 0x9, flags_taken: 0, flags_not: FLAG_SF },               // NS
        Case { cc: 0xA, flags_taken: crate::cpu_ia32::FLAG_PF, flags_not: 0 }, // P
        Case { cc: 0xB, flags_taken: 0, flags_not: crate::cpu_ia32::FLAG_PF }, // NP
        Case { cc: 0xC, flags_taken: FLAG_SF, flags_not: FLAG_SF | FLAG_OF }, // L
        Case { cc: 0xD, flags_taken: FLAG_SF | FLAG_OF, flags_not: FLAG_OF }, // NL
        Case { cc: 0xE, flags_taken: FLAG_ZF, flags_not: 0 },               // LE
        Case { cc: 0xF, flags_taken: 0, flags_not: FLAG_ZF },               // NLE
    ];

    for case in &cases {
        let mut cpu = test_cpu();
        load(&mut cpu, 0x100, &[0x70 | case.cc, 0x10]);
        cpu.eflags = 0x2 | case.flags_taken;
        cpu.step().unwrap();
        assert_eq!(cpu.eip, 0x112, "cc {:#x} should be taken", case.cc);

        let mut cpu = test_cpu();
        load(&mut cpu, 0x100, &[0x70 | case.cc, 0x10]);
        cpu.eflags = 0x2 | case.flags_not;
        cpu.step().unwrap();
        assert_eq!(cpu.eip, 0x102, "cc {:#x} should fall through", case.cc);
    }
}

#[test]
fn test_jcc_near_rel32() {
    let mut cpu = test_cpu();

    // 0F 84 00 02 00 00 = JZ near +0x200
    load(&mut cpu, 0x100, &[0x0F, 0x84, 0x00, 0x02, 0x00, 0x00]);
    cpu.set_flag(FLAG_ZF, true);
    cpu.step().unwrap();

    assert_eq!(cpu.eip, 0x306);
}

#[test]
fn test_call_pushes_return_address() {
    let mut cpu = test_cpu();

    // E8 00 02 00 00 = CALL +0x200
    load(&mut cpu, 0x100, &[0xE8, 0x00, 0x02, 0x00, 0x00]);
    let esp0 = cpu.esp;
    cpu.step().unwrap();

    assert_eq!(cpu.eip, 0x305);
    assert_eq!(cpu.esp, esp0 - 4);
    assert_eq!(
        cpu.memory.read_u32(cpu.esp).unwrap(),
        0x105,
        "return address is the next instruction"
    );
}

#[test]
fn test_call_ret_roundtrip() {
    let mut cpu = test_cpu();

    // 0x100: CALL 0x200; 0x105: NOP (the return target)
    // 0x200: C3 = RET
    load(&mut cpu, 0x100, &[0xE8, 0xFB, 0x00, 0x00, 0x00, 0x90]);
    load(&mut cpu, 0x200, &[0xC3]);
    cpu.eip = 0x100;
    let esp0 = cpu.esp;

    cpu.step().unwrap();
    assert_eq!(cpu.eip, 0x200);

    cpu.step().unwrap();
    assert_eq!(cpu.eip, 0x105, "RET lands after the CALL");
    assert_eq!(cpu.esp, esp0, "ESP restored exactly");
}

#[test]
fn test_call_rm32() {
    let mut cpu = test_cpu();

    // FF D3 = CALL EBX
    load(&mut cpu, 0x100, &[0xFF, 0xD3]);
    cpu.ebx = 0x400;
    cpu.step().unwrap();

    assert_eq!(cpu.eip, 0x400);
    assert_eq!(cpu.memory.read_u32(cpu.esp).unwrap(), 0x102);
}

#[test]
fn test_ret_imm_pops_arguments() {
    let mut cpu = test_cpu();

    // C2 08 00 = RET 8
    load(&mut cpu, 0x200, &[0xC2, 0x08, 0x00]);
    cpu.esp = 0x8000;
    cpu.memory.write_u32(0x8000, 0x555).unwrap();
    cpu.eip = 0x200;
    cpu.step().unwrap();

    assert_eq!(cpu.eip, 0x555);
    assert_eq!(cpu.esp, 0x8000 + 4 + 8, "imm16 discards the arguments");
}

#[test]
fn test_unknown_opcode_reports_eip() {
    let mut cpu = test_cpu();

    // 0xD6 (SALC) is not part of this subset
    load(&mut cpu, 0x100, &[0x90, 0xD6]);
    cpu.step().unwrap();

    let err = cpu.step().unwrap_err();
    match err {
        crate::cpu_ia32::VmError::UnknownOpcode { eip, bytes } => {
            assert_eq!(eip, 0x101, "EIP points at the offending byte");
            assert_eq!(bytes, vec![0xD6]);
        }
        other => panic!("expected UnknownOpcode, got {other:?}"),
    }
}

#[test]
fn test_unknown_two_byte_opcode() {
    let mut cpu = test_cpu();

    // 0F 05 (SYSCALL) is not part of this subset
    load(&mut cpu, 0x100, &[0x0F, 0x05]);
    let err = cpu.step().unwrap_err();
    match err {
        crate::cpu_ia32::VmError::UnknownOpcode { bytes, .. } => {
            assert_eq!(bytes, vec![0x0F, 0x05]);
        }
        other => panic!("expected UnknownOpcode, got {other:?}"),
    }
}
