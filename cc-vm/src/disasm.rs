use std::fmt::Write;

use crate::vm::{Address, OpCode, WORD_SIZE, Word};

/// Lists every instruction in `cells`, one per line.
pub fn disassemble(cells: &[Word]) -> String {
    disassemble_range(cells, 0, cells.len())
}

/// Decodes from `start`, which must be an instruction boundary, and lists the
/// instructions that begin before `end`.
pub fn disassemble_range(cells: &[Word], start: usize, end: usize) -> String {
    let mut out = String::new();
    let mut index = start;
    while index < end.min(cells.len()) {
        let word = cells[index];
        let Some(op) = OpCode::from_word(word) else {
            let _ = writeln!(&mut out, "{index:04}: .word {word} ; invalid opcode");
            index += 1;
            continue;
        };
        if op.has_operand() {
            let operand = cells
                .get(index + 1)
                .map(|value| format_operand(op, *value))
                .unwrap_or_else(|| "<pending>".to_string());
            let _ = writeln!(&mut out, "{index:04}: {:<4} {operand}", op.mnemonic());
        } else {
            let _ = writeln!(&mut out, "{index:04}: {}", op.mnemonic());
        }
        index += op.width();
    }
    out
}

/// Renders an operand cell: branch targets as `@cell`, segment addresses
/// loaded by `IMM` as `&segment+offset`, everything else as a plain integer.
pub fn format_operand(op: OpCode, value: Word) -> String {
    match (op, Address::decode(value)) {
        (op, Address::Code(offset)) if op.is_branch() && offset % WORD_SIZE == 0 => {
            format!("@{:04}", offset / WORD_SIZE)
        }
        (OpCode::Imm, address) => match (address, address.segment()) {
            (Address::Code(offset) | Address::Data(offset) | Address::Stack(offset), Some(kind)) => {
                format!("&{kind}+{offset}")
            }
            _ => value.to_string(),
        },
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{disassemble, disassemble_range, format_operand};
    use crate::vm::{Address, OpCode, WORD_SIZE, Word};

    #[test]
    fn lists_instructions_with_cell_offsets() {
        let cells = [
            OpCode::Imm as Word,
            10,
            OpCode::Push as Word,
            OpCode::Jmp as Word,
            Address::Code(2 * WORD_SIZE).encode(),
            OpCode::Exit as Word,
        ];
        assert_eq!(
            disassemble(&cells),
            "0000: IMM  10\n0002: PUSH\n0003: JMP  @0002\n0005: EXIT\n"
        );
    }

    #[test]
    fn marks_invalid_and_pending_cells() {
        let cells = [99, OpCode::Lea as Word];
        assert_eq!(
            disassemble(&cells),
            "0000: .word 99 ; invalid opcode\n0001: LEA  <pending>\n"
        );
    }

    #[test]
    fn range_stops_before_end() {
        let cells = [
            OpCode::Push as Word,
            OpCode::Adj as Word,
            2,
            OpCode::Exit as Word,
        ];
        assert_eq!(disassemble_range(&cells, 1, 3), "0001: ADJ  2\n");
    }

    #[test]
    fn imm_shows_segment_addresses() {
        let data = Address::Data(16).encode();
        assert_eq!(format_operand(OpCode::Imm, data), "&data+16");
        assert_eq!(format_operand(OpCode::Imm, -3), "-3");
        assert_eq!(format_operand(OpCode::Lea, 2), "2");
    }
}
