use std::collections::HashMap;

use crate::vm::{Address, ENTRY_STUB_CELLS, Machine, OpCode, VmError, VmResult, WORD_SIZE, Word};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    DuplicateLabel(String),
    DuplicateSymbol(String),
    UnknownLabel(String),
    OperandMismatch(OpCode),
}

impl std::fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssemblerError::DuplicateLabel(name) => write!(f, "duplicate label '{name}'"),
            AssemblerError::DuplicateSymbol(name) => write!(f, "duplicate data symbol '{name}'"),
            AssemblerError::UnknownLabel(name) => write!(f, "unknown label or symbol '{name}'"),
            AssemblerError::OperandMismatch(op) => {
                if op.has_operand() {
                    write!(f, "{} takes one operand", op.mnemonic())
                } else {
                    write!(f, "{} takes no operand", op.mnemonic())
                }
            }
        }
    }
}

impl std::error::Error for AssemblerError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cell {
    Word(Word),
    /// A label or data symbol, resolved when the program is loaded.
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DataItem {
    Word { name: String, value: Word },
    String { name: String, text: String },
}

impl DataItem {
    fn name(&self) -> &str {
        match self {
            DataItem::Word { name, .. } | DataItem::String { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    label: String,
    argc: Word,
}

/// Relocatable code plus the data it refers to.
///
/// Label operands are stored by name and become code addresses only in
/// [`Program::load`], relative to wherever the machine's code currently ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    cells: Vec<Cell>,
    labels: HashMap<String, usize>,
    data: Vec<DataItem>,
    entry: Option<Entry>,
}

/// Addresses assigned while loading a [`Program`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedProgram {
    pub code_start: Word,
    pub symbols: HashMap<String, Word>,
    pub entry: Option<Word>,
}

impl Program {
    /// Code cells, not counting the entry stub added on load.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn label_offset(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Places the data items, appends the relocated code and, when the
    /// program names an entry label, builds the entry frame and points `pc`
    /// at it. Without an entry `pc` is left alone.
    pub fn load(&self, machine: &mut Machine) -> VmResult<LoadedProgram> {
        let base = machine.op_counter();
        let stub = if self.entry.is_some() { ENTRY_STUB_CELLS } else { 0 };
        if base + self.cells.len() + stub > machine.capacity() {
            return Err(VmError::OpCounterOverflow {
                capacity: machine.capacity(),
            });
        }

        let mut symbols = HashMap::new();
        for item in &self.data {
            let address = match item {
                DataItem::Word { value, .. } => machine.put_constant(*value)?,
                DataItem::String { text, .. } => machine.put_string(text)?,
            };
            symbols.insert(item.name().to_string(), address);
        }
        for (name, offset) in &self.labels {
            symbols.insert(
                name.clone(),
                Address::Code((base + offset) * WORD_SIZE).encode(),
            );
        }

        let words = self
            .cells
            .iter()
            .map(|cell| match cell {
                Cell::Word(word) => Ok(*word),
                Cell::Name(name) => symbols
                    .get(name)
                    .copied()
                    .ok_or_else(|| VmError::UnresolvedSymbol(name.clone())),
            })
            .collect::<VmResult<Vec<_>>>()?;
        machine.append_all(&words)?;

        let entry = match &self.entry {
            Some(entry) => {
                let address = symbols
                    .get(&entry.label)
                    .copied()
                    .ok_or_else(|| VmError::UnresolvedSymbol(entry.label.clone()))?;
                machine.setup_entry(address, entry.argc, 0)?;
                Some(address)
            }
            None => None,
        };

        Ok(LoadedProgram {
            code_start: Address::Code(base * WORD_SIZE).encode(),
            symbols,
            entry,
        })
    }
}

pub struct Assembler {
    cells: Vec<Cell>,
    labels: HashMap<String, usize>,
    data: Vec<DataItem>,
    entry: Option<Entry>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            cells: Vec::new(),
            labels: HashMap::new(),
            data: Vec::new(),
            entry: None,
        }
    }

    /// Cell index the next instruction will occupy.
    pub fn position(&self) -> usize {
        self.cells.len()
    }

    pub fn label(&mut self, name: &str) -> Result<(), AssemblerError> {
        if self.labels.contains_key(name) {
            return Err(AssemblerError::DuplicateLabel(name.to_string()));
        }
        if self.has_data(name) {
            return Err(AssemblerError::DuplicateSymbol(name.to_string()));
        }
        let pos = self.position();
        self.labels.insert(name.to_string(), pos);
        Ok(())
    }

    pub fn word(&mut self, name: &str, value: Word) -> Result<(), AssemblerError> {
        self.check_data_name(name)?;
        self.data.push(DataItem::Word {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    pub fn string(&mut self, name: &str, text: &str) -> Result<(), AssemblerError> {
        self.check_data_name(name)?;
        self.data.push(DataItem::String {
            name: name.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    pub fn entry(&mut self, label: &str, argc: Word) {
        self.entry = Some(Entry {
            label: label.to_string(),
            argc,
        });
    }

    pub fn op(&mut self, op: OpCode) -> Result<(), AssemblerError> {
        if op.has_operand() {
            return Err(AssemblerError::OperandMismatch(op));
        }
        self.emit_opcode(op);
        Ok(())
    }

    pub fn op_with(&mut self, op: OpCode, operand: Word) -> Result<(), AssemblerError> {
        if !op.has_operand() {
            return Err(AssemblerError::OperandMismatch(op));
        }
        self.emit_opcode(op);
        self.cells.push(Cell::Word(operand));
        Ok(())
    }

    /// Emits `op` with a label or data symbol as its operand.
    pub fn op_ref(&mut self, op: OpCode, name: &str) -> Result<(), AssemblerError> {
        if !op.has_operand() {
            return Err(AssemblerError::OperandMismatch(op));
        }
        self.emit_opcode(op);
        self.cells.push(Cell::Name(name.to_string()));
        Ok(())
    }

    pub fn imm(&mut self, value: Word) {
        self.emit_opcode(OpCode::Imm);
        self.cells.push(Cell::Word(value));
    }

    pub fn imm_ref(&mut self, name: &str) {
        self.emit_opcode(OpCode::Imm);
        self.cells.push(Cell::Name(name.to_string()));
    }

    pub fn lea(&mut self, slot: Word) {
        self.emit_opcode(OpCode::Lea);
        self.cells.push(Cell::Word(slot));
    }

    pub fn ent(&mut self, locals: Word) {
        self.emit_opcode(OpCode::Ent);
        self.cells.push(Cell::Word(locals));
    }

    pub fn adj(&mut self, cells: Word) {
        self.emit_opcode(OpCode::Adj);
        self.cells.push(Cell::Word(cells));
    }

    pub fn jmp_label(&mut self, label: &str) {
        self.emit_opcode(OpCode::Jmp);
        self.cells.push(Cell::Name(label.to_string()));
    }

    pub fn jz_label(&mut self, label: &str) {
        self.emit_opcode(OpCode::Jz);
        self.cells.push(Cell::Name(label.to_string()));
    }

    pub fn jnz_label(&mut self, label: &str) {
        self.emit_opcode(OpCode::Jnz);
        self.cells.push(Cell::Name(label.to_string()));
    }

    pub fn call_label(&mut self, label: &str) {
        self.emit_opcode(OpCode::Call);
        self.cells.push(Cell::Name(label.to_string()));
    }

    pub fn lev(&mut self) {
        self.emit_opcode(OpCode::Lev);
    }

    pub fn li(&mut self) {
        self.emit_opcode(OpCode::Li);
    }

    pub fn si(&mut self) {
        self.emit_opcode(OpCode::Si);
    }

    pub fn push(&mut self) {
        self.emit_opcode(OpCode::Push);
    }

    /// `PRTF` followed by the `ADJ` that pops its `args` arguments.
    pub fn prtf(&mut self, args: Word) {
        self.emit_opcode(OpCode::Prtf);
        self.adj(args);
    }

    pub fn exit(&mut self) {
        self.emit_opcode(OpCode::Exit);
    }

    pub fn finish_program(self) -> Result<Program, AssemblerError> {
        for cell in &self.cells {
            if let Cell::Name(name) = cell
                && !self.labels.contains_key(name)
                && !self.has_data(name)
            {
                return Err(AssemblerError::UnknownLabel(name.clone()));
            }
        }
        if let Some(entry) = &self.entry
            && !self.labels.contains_key(&entry.label)
        {
            return Err(AssemblerError::UnknownLabel(entry.label.clone()));
        }
        Ok(Program {
            cells: self.cells,
            labels: self.labels,
            data: self.data,
            entry: self.entry,
        })
    }

    fn has_data(&self, name: &str) -> bool {
        self.data.iter().any(|item| item.name() == name)
    }

    fn check_data_name(&self, name: &str) -> Result<(), AssemblerError> {
        if self.has_data(name) || self.labels.contains_key(name) {
            return Err(AssemblerError::DuplicateSymbol(name.to_string()));
        }
        Ok(())
    }

    fn emit_opcode(&mut self, opcode: OpCode) {
        self.cells.push(Cell::Word(opcode as Word));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmParseError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for AsmParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for AsmParseError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AsmSection {
    Data,
    Code,
}

enum Operand<'a> {
    Value(Word),
    Name(&'a str),
}

struct Instruction<'a> {
    op: OpCode,
    operand: Option<Operand<'a>>,
}

pub fn assemble(source: &str) -> Result<Program, AsmParseError> {
    let mut assembler = Assembler::new();
    let mut section = AsmSection::Code;

    for (line_idx, raw_line) in source.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = strip_comments(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if line.ends_with(':') {
            return Err(AsmParseError {
                line: line_no,
                message: "label definitions must use '.label NAME'".to_string(),
            });
        }

        let (directive, rest) = match line.strip_prefix('.') {
            Some(rest) => (true, rest),
            None if section == AsmSection::Data => (true, line),
            None => (false, line),
        };
        if directive {
            let mut parts = rest.split_whitespace();
            let name = parts.next().unwrap_or("").to_ascii_lowercase();
            let mut check_extra = true;
            match name.as_str() {
                "data" => section = AsmSection::Data,
                "code" => section = AsmSection::Code,
                "label" => {
                    let label = next_token(&mut parts, line_no, "label name")?;
                    if section != AsmSection::Code {
                        return Err(AsmParseError {
                            line: line_no,
                            message: "labels are only valid in code section".to_string(),
                        });
                    }
                    assembler.label(label).map_err(|err| AsmParseError {
                        line: line_no,
                        message: err.to_string(),
                    })?;
                }
                "word" => {
                    let symbol = next_token(&mut parts, line_no, "word name")?;
                    let value = parse_word(next_token(&mut parts, line_no, "word value")?, line_no)?;
                    assembler.word(symbol, value).map_err(|err| AsmParseError {
                        line: line_no,
                        message: err.to_string(),
                    })?;
                }
                "string" => {
                    check_extra = false;
                    let symbol = next_token(&mut parts, line_no, "string name")?;
                    let literal = rest_after_n_tokens(rest, 2).unwrap_or("");
                    if literal.is_empty() {
                        return Err(AsmParseError {
                            line: line_no,
                            message: "missing string literal".to_string(),
                        });
                    }
                    let text = parse_string_literal(literal, line_no)?;
                    assembler.string(symbol, &text).map_err(|err| AsmParseError {
                        line: line_no,
                        message: err.to_string(),
                    })?;
                }
                "entry" => {
                    let label = next_token(&mut parts, line_no, "entry label")?;
                    let argc = match parts.next() {
                        Some(token) => parse_word(token, line_no)?,
                        None => 0,
                    };
                    assembler.entry(label, argc);
                }
                other if section == AsmSection::Data && !line.starts_with('.') => {
                    return Err(AsmParseError {
                        line: line_no,
                        message: format!("unexpected '{other}' in data section"),
                    });
                }
                other => {
                    return Err(AsmParseError {
                        line: line_no,
                        message: format!("unknown directive '.{other}'"),
                    });
                }
            }
            if check_extra && parts.next().is_some() {
                return Err(AsmParseError {
                    line: line_no,
                    message: "unexpected extra tokens".to_string(),
                });
            }
            continue;
        }

        let Instruction { op, operand } = parse_line(line, line_no)?;
        let emitted = match operand {
            None => assembler.op(op),
            Some(Operand::Value(value)) => assembler.op_with(op, value),
            Some(Operand::Name(name)) => assembler.op_ref(op, name),
        };
        emitted.map_err(|err| AsmParseError {
            line: line_no,
            message: err.to_string(),
        })?;
    }

    assembler.finish_program().map_err(|err| AsmParseError {
        line: 0,
        message: format!("assembler error: {err}"),
    })
}

/// Turns one interactive line into code cells.
///
/// Unlike [`assemble`], a line may hold a bare integer (an operand sent on
/// its own) or an operand-taking opcode without its operand, so that an
/// instruction can be committed one cell at a time. Names resolve through
/// `symbols`.
pub fn parse_instruction(
    line: &str,
    symbols: &HashMap<String, Word>,
) -> Result<Vec<Word>, AsmParseError> {
    let line = strip_comments(line).trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = line.split_whitespace();
    let first = next_token(&mut parts, 1, "opcode")?;
    if parts.clone().next().is_none()
        && let Some(value) = parse_int(first)
    {
        return Ok(vec![value]);
    }
    if parts.next().is_none()
        && let Some(op) = OpCode::parse_mnemonic(first)
    {
        return Ok(vec![op as Word]);
    }

    let Instruction { op, operand } = parse_line(line, 1)?;
    let mut cells = vec![op as Word];
    match operand {
        None => {}
        Some(Operand::Value(value)) => cells.push(value),
        Some(Operand::Name(name)) => {
            let address = symbols.get(name).copied().ok_or_else(|| AsmParseError {
                line: 1,
                message: format!("unknown label or symbol '{name}'"),
            })?;
            cells.push(address);
        }
    }
    Ok(cells)
}

fn parse_line(line: &str, line_no: usize) -> Result<Instruction<'_>, AsmParseError> {
    let mut parts = line.split_whitespace();
    let mnemonic = next_token(&mut parts, line_no, "opcode")?;
    let op = OpCode::parse_mnemonic(mnemonic).ok_or_else(|| AsmParseError {
        line: line_no,
        message: format!("unknown opcode '{mnemonic}'"),
    })?;
    let operand = if op.has_operand() {
        let token = next_token(&mut parts, line_no, &format!("{} operand", op.mnemonic()))?;
        Some(match parse_int(token) {
            Some(value) => Operand::Value(value),
            None if is_identifier(token) => Operand::Name(token),
            None => {
                return Err(AsmParseError {
                    line: line_no,
                    message: format!("invalid operand '{token}'"),
                });
            }
        })
    } else {
        None
    };
    if parts.next().is_some() {
        return Err(AsmParseError {
            line: line_no,
            message: "unexpected extra tokens".to_string(),
        });
    }
    Ok(Instruction { op, operand })
}

/// Cuts a trailing `;` or `#` comment, ignoring both inside string literals.
fn strip_comments(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in line.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            ';' | '#' => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn next_token<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    line_no: usize,
    what: &str,
) -> Result<&'a str, AsmParseError> {
    parts.next().ok_or_else(|| AsmParseError {
        line: line_no,
        message: format!("missing {what}"),
    })
}

fn parse_int(token: &str) -> Option<Word> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok()? as Word,
        None => digits.parse::<Word>().ok()?,
    };
    Some(if negative {
        magnitude.wrapping_neg()
    } else {
        magnitude
    })
}

fn parse_word(token: &str, line_no: usize) -> Result<Word, AsmParseError> {
    parse_int(token).ok_or_else(|| AsmParseError {
        line: line_no,
        message: format!("invalid integer '{token}'"),
    })
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn parse_string_literal(token: &str, line_no: usize) -> Result<String, AsmParseError> {
    let mut chars = token.char_indices();
    if chars.next().map(|(_, ch)| ch) != Some('"') {
        return Err(AsmParseError {
            line: line_no,
            message: "string literal must start with '\"'".to_string(),
        });
    }

    let mut out = String::new();
    let mut escaped = false;
    let mut end_idx = None;

    for (idx, ch) in chars {
        if escaped {
            let mapped = match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                '\\' => '\\',
                '"' => '"',
                other => {
                    return Err(AsmParseError {
                        line: line_no,
                        message: format!("invalid escape '\\{other}'"),
                    });
                }
            };
            out.push(mapped);
            escaped = false;
            continue;
        }

        match ch {
            '\\' => escaped = true,
            '"' => {
                end_idx = Some(idx);
                break;
            }
            other => out.push(other),
        }
    }

    let Some(end_idx) = end_idx else {
        return Err(AsmParseError {
            line: line_no,
            message: "unterminated string literal".to_string(),
        });
    };

    if token[end_idx + 1..].trim().is_empty() {
        Ok(out)
    } else {
        Err(AsmParseError {
            line: line_no,
            message: "unexpected trailing characters after string literal".to_string(),
        })
    }
}

fn rest_after_n_tokens(line: &str, n: usize) -> Option<&str> {
    let mut count = 0;
    let mut in_token = false;
    let mut end_idx = 0;
    for (idx, ch) in line.char_indices() {
        if ch.is_whitespace() {
            if in_token {
                in_token = false;
                count += 1;
                if count == n {
                    end_idx = idx;
                    break;
                }
            }
        } else if !in_token {
            in_token = true;
        }
    }

    if in_token {
        count += 1;
        end_idx = line.len();
    }

    if count < n {
        None
    } else {
        Some(line[end_idx..].trim_start())
    }
}
