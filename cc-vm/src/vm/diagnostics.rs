use super::{Machine, VmError};

pub fn render_vm_error(machine: &Machine, err: &VmError) -> String {
    let mut out = format!("runtime error: {err}");
    let cell = machine.last_instruction_offset();
    out.push_str(&format!("\nat pc cell {cell} (cycle {})", machine.cycle()));
    let cells = machine.code_cells();
    if let Some(line) = crate::disasm::disassemble_range(&cells, cell, cell + 1)
        .lines()
        .next()
    {
        out.push_str(&format!("\n  | {line}"));
    }
    out
}
