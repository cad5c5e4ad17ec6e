//! Classic-BPF VNI matcher (§4.3 "VNI BPF Matcher", §8 item 3, §8 S6).
//!
//! Given a UDP datagram whose payload is a VXLAN header, the program loads
//! the 4-byte word at payload offset 4 (the VNI + reserved byte), shifts it
//! right by 8 bits to drop the reserved low byte, and compares the result
//! against the target VNI. Rendered into the decimal `sock_filter` byte-code
//! string the `iptables -m bpf --bytecode` match expects: `"N,op jt jf k ..."`
//! per instruction, matching `linux/filter.h`'s 8-byte wire layout
//! (`u16 code; u8 jt; u8 jf; u32 k`).
//!
//! No crate in the retrieval pack assembles classic BPF directly; this is a
//! small, self-contained encoder rather than a borrowed idiom.

/// BPF class/opcode constants from `linux/bpf_common.h`, just the subset
/// this one program needs.
mod op {
    pub const LD_W_ABS: u16 = 0x00 | 0x20 | 0x00; // BPF_LD | BPF_W | BPF_ABS
    pub const ALU_RSH_K: u16 = 0x04 | 0x70 | 0x00; // BPF_ALU | BPF_RSH | BPF_K
    pub const JMP_JEQ_K: u16 = 0x05 | 0x10 | 0x00; // BPF_JMP | BPF_JEQ | BPF_K
    pub const RET_K: u16 = 0x06 | 0x00; // BPF_RET | BPF_K
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// Byte offset of the VXLAN header within the UDP payload is 0 relative to
/// the point `BPF_LD|BPF_W|BPF_ABS` addresses when loaded against the whole
/// packet staring at the UDP payload: iptables' `xt_bpf` match hands the
/// filter the socket buffer starting at the network layer, so the absolute
/// offset used here is relative to the start of the IP payload as delivered
/// to `xt_bpf`, i.e. UDP header (8 bytes) + 4. §4.3/§8 S6 only fix the
/// *relative* shape: load 4 bytes at "UDP payload offset 4", shift right 8,
/// compare to vni. We encode that contract directly.
const VXLAN_VNI_WORD_OFFSET: u32 = 8 + 4;

/// Build the 4-instruction classic-BPF program that accepts exactly the
/// datagrams whose VXLAN VNI equals `vni` (24-bit — the high 24 bits of the
/// big-endian word at the VNI offset).
pub fn match_vxlan(vni: u32) -> Vec<Instruction> {
    debug_assert!(vni < 1 << 24, "VNI must fit in 24 bits");
    vec![
        Instruction { code: op::LD_W_ABS, jt: 0, jf: 0, k: VXLAN_VNI_WORD_OFFSET },
        Instruction { code: op::ALU_RSH_K, jt: 0, jf: 0, k: 8 },
        Instruction { code: op::JMP_JEQ_K, jt: 0, jf: 1, k: vni },
        Instruction { code: op::RET_K, jt: 0, jf: 0, k: 0xffff },
    ]
    .into_iter()
    .chain(std::iter::once(Instruction { code: op::RET_K, jt: 0, jf: 0, k: 0 }))
    .collect()
}

/// Evaluate the program against a literal payload, for testing the encoder
/// itself independent of the kernel (§8 item 3/S6): interprets only the
/// instruction shapes `match_vxlan` produces. `jt`/`jf` are instruction
/// counts to skip forward, per classic-BPF semantics.
pub fn accepts(program: &[Instruction], payload: &[u8]) -> bool {
    let mut acc: u32 = 0;
    let mut pc: usize = 0;
    while pc < program.len() {
        let insn = &program[pc];
        match insn.code {
            c if c == op::LD_W_ABS => {
                let off = insn.k as usize;
                if payload.len() < off + 4 {
                    return false;
                }
                acc = u32::from_be_bytes(payload[off..off + 4].try_into().unwrap());
                pc += 1;
            }
            c if c == op::ALU_RSH_K => {
                acc >>= insn.k;
                pc += 1;
            }
            c if c == op::JMP_JEQ_K => {
                pc += 1 + if acc == insn.k { insn.jt as usize } else { insn.jf as usize };
            }
            c if c == op::RET_K => return insn.k != 0,
            _ => unreachable!("unknown opcode in generated program"),
        }
    }
    false
}

/// Render the program into the decimal byte-code string `xt_bpf` expects:
/// `"<n>,<code> <jt> <jf> <k>,..."` with one comma-joined group per
/// instruction, `n` instructions total.
pub fn render_bytecode(program: &[Instruction]) -> String {
    let mut groups = Vec::with_capacity(program.len());
    for insn in program {
        groups.push(format!("{} {} {} {}", insn.code, insn.jt, insn.jf, insn.k));
    }
    format!("{},{}", program.len(), groups.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_five_instructions() {
        let program = match_vxlan(42);
        assert_eq!(program.len(), 5);
        let rendered = render_bytecode(&program);
        assert!(rendered.starts_with("5,"));
    }

    #[test]
    fn vector_s6_accepts_and_rejects() {
        let program = match_vxlan(42);
        let mut payload = vec![0u8; 16];
        // UDP header is 8 bytes of padding here; VXLAN header starts at 8.
        payload[8..16].copy_from_slice(&[0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A, 0x00]);
        assert!(accepts(&program, &payload));

        payload[8..16].copy_from_slice(&[0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2B, 0x00]);
        assert!(!accepts(&program, &payload));
    }

    #[test]
    fn matches_only_the_target_vni_over_a_sample_range() {
        for vni in [0u32, 1, 42, 4097, 0xABCDEF, (1 << 24) - 1] {
            let program = match_vxlan(vni);
            let mut payload = vec![0u8; 16];
            let word = (vni << 8).to_be_bytes();
            payload[12..16].copy_from_slice(&word);
            assert!(accepts(&program, &payload), "vni {} should accept its own payload", vni);

            let other = vni ^ 1;
            let mut other_payload = vec![0u8; 16];
            other_payload[12..16].copy_from_slice(&(other << 8).to_be_bytes());
            assert!(!accepts(&program, &other_payload), "vni {} should reject {}", vni, other);
        }
    }
}
