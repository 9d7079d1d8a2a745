//! Text assembler for bytecode programs.
//!
//! ```text
//! ; comments start with ';' or '#'
//! .code <module>              ; the first block is the module body
//! .line 1
//!     LOAD_NAME input
//!     CALL_FUNCTION 0
//!     STORE_NAME data
//!     POP_JUMP_IF_FALSE @done
//! done:
//!     LOAD_CONST None
//!     RETURN_VALUE
//! .end
//!
//! .code greet
//! .args name
//!     LOAD_FAST name
//!     RETURN_VALUE
//! .end
//! ```
//!
//! Operands are raw integers, `@label` jump targets, identifiers for name and
//! local-variable operands, literals for `LOAD_CONST` (`None`, `True`, ints,
//! floats, `"strings"`, tuples, `code:<block>`), and comparison symbols for
//! `COMPARE_OP`.

use crate::bytecode::{CodeObject, CompareOp, Constant, Instruction, OpCode};
use crate::strings::NameTable;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AsmError {
    #[error("unknown opcode '{name}' at line {line}")]
    UnknownOpcode { name: String, line: usize },
    #[error("unknown label '{label}' at line {line}")]
    UnknownLabel { label: String, line: usize },
    #[error("unknown code block '{name}' at line {line}")]
    UnknownCode { name: String, line: usize },
    #[error("bad operand '{text}' at line {line}: {reason}")]
    BadOperand { text: String, line: usize, reason: String },
    #[error("{op} needs an operand at line {line}")]
    MissingOperand { op: String, line: usize },
    #[error("unexpected directive '{directive}' at line {line}")]
    UnexpectedDirective { directive: String, line: usize },
    #[error("instruction outside a .code block at line {line}")]
    OutsideBlock { line: usize },
    #[error("code block '{name}' refers to itself")]
    RecursiveCode { name: String },
    #[error("no .code block found")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
enum RawConst {
    Value(Constant),
    Tuple(Vec<RawConst>),
    Code(String),
}

#[derive(Debug, Clone)]
enum RawOperand {
    Int(u32),
    Label(String),
    Name(String),
    Var(String),
    Const(RawConst),
}

#[derive(Debug)]
struct RawInstr {
    op: OpCode,
    operand: Option<RawOperand>,
    line: u32,
    source_line: usize,
}

#[derive(Debug)]
struct RawCode {
    name: String,
    filename: String,
    first_line: u32,
    args: Vec<String>,
    instrs: Vec<RawInstr>,
    labels: HashMap<String, usize>,
}

/// Assemble `source`; the first block becomes the module body for `filename`.
pub fn assemble(source: &str, filename: &str) -> Result<Rc<CodeObject>, AsmError> {
    let blocks = parse_blocks(source, filename)?;
    let main = blocks.first().map(|b| b.name.clone()).ok_or(AsmError::Empty)?;
    let mut linker = Linker { blocks: blocks.into_iter().map(|b| (b.name.clone(), b)).collect(), done: HashMap::new(), active: Vec::new() };
    linker.build(&main, 0)
}

fn parse_blocks(source: &str, filename: &str) -> Result<Vec<RawCode>, AsmError> {
    let mut blocks = Vec::new();
    let mut current: Option<RawCode> = None;
    let mut line_no: u32 = 0;

    for (idx, raw_line) in source.lines().enumerate() {
        let source_line = idx + 1;
        let text = strip_comment(raw_line).trim();
        if text.is_empty() {
            continue;
        }

        if let Some(directive) = text.strip_prefix('.') {
            let (word, rest) = split_word(directive);
            match word {
                "code" => {
                    if let Some(done) = current.take() {
                        blocks.push(done);
                    }
                    let name = if rest.is_empty() { "<module>".to_string() } else { rest.to_string() };
                    current = Some(RawCode {
                        name,
                        filename: filename.to_string(),
                        first_line: line_no,
                        args: Vec::new(),
                        instrs: Vec::new(),
                        labels: HashMap::new(),
                    });
                }
                "end" => {
                    if let Some(done) = current.take() {
                        blocks.push(done);
                    }
                }
                "line" => {
                    line_no = rest.parse().map_err(|_| AsmError::BadOperand {
                        text: rest.to_string(),
                        line: source_line,
                        reason: "expected a line number".into(),
                    })?;
                    if let Some(code) = current.as_mut() {
                        if code.instrs.is_empty() {
                            code.first_line = line_no;
                        }
                    }
                }
                "file" | "args" => {
                    let code = current.as_mut().ok_or(AsmError::OutsideBlock { line: source_line })?;
                    if word == "file" {
                        code.filename = unquote(rest).unwrap_or(rest).to_string();
                    } else {
                        code.args = rest.split_whitespace().map(str::to_string).collect();
                    }
                }
                other => {
                    return Err(AsmError::UnexpectedDirective { directive: other.to_string(), line: source_line })
                }
            }
            continue;
        }

        let code = current.as_mut().ok_or(AsmError::OutsideBlock { line: source_line })?;

        if let Some(label) = text.strip_suffix(':') {
            code.labels.insert(label.trim().to_string(), code.instrs.len());
            continue;
        }

        let (mnemonic, rest) = split_word(text);
        let op = OpCode::from_str(mnemonic)
            .map_err(|_| AsmError::UnknownOpcode { name: mnemonic.to_string(), line: source_line })?;
        let operand = parse_operand(op, rest, source_line)?;
        code.instrs.push(RawInstr { op, operand, line: line_no, source_line });
    }

    if let Some(done) = current.take() {
        blocks.push(done);
    }
    if blocks.is_empty() {
        return Err(AsmError::Empty);
    }
    Ok(blocks)
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut chars = line.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' if in_string => {
                chars.next();
            }
            '"' => in_string = !in_string,
            ';' | '#' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

fn split_word(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(pos) => (&text[..pos], text[pos..].trim()),
        None => (text, ""),
    }
}

fn unquote(text: &str) -> Option<&str> {
    text.strip_prefix('"').and_then(|t| t.strip_suffix('"'))
}

fn parse_operand(op: OpCode, rest: &str, line: usize) -> Result<Option<RawOperand>, AsmError> {
    let bad = |reason: &str| AsmError::BadOperand { text: rest.to_string(), line, reason: reason.to_string() };

    if op == OpCode::LoadConst {
        if rest.is_empty() {
            return Err(AsmError::MissingOperand { op: op.name().into(), line });
        }
        let mut parser = LiteralParser { chars: rest.chars().collect(), pos: 0 };
        let value = parser.literal().map_err(|reason| bad(&reason))?;
        parser.skip_ws();
        if parser.pos < parser.chars.len() {
            return Err(bad("trailing text after literal"));
        }
        return Ok(Some(RawOperand::Const(value)));
    }

    if rest.is_empty() {
        if op.uses_name() || op.uses_varname() || op.has_absolute_target() || op.has_relative_target() {
            return Err(AsmError::MissingOperand { op: op.name().into(), line });
        }
        return Ok(None);
    }

    if let Some(label) = rest.strip_prefix('@') {
        if !(op.has_absolute_target() || op.has_relative_target()) {
            return Err(bad("labels are only valid on jumps"));
        }
        return Ok(Some(RawOperand::Label(label.to_string())));
    }
    if op.uses_name() {
        return Ok(Some(RawOperand::Name(rest.to_string())));
    }
    if op.uses_varname() {
        return Ok(Some(RawOperand::Var(rest.to_string())));
    }
    if op == OpCode::CompareOp {
        if let Some(cmp) = CompareOp::from_symbol(rest).and_then(CompareOp::to_arg) {
            return Ok(Some(RawOperand::Int(cmp)));
        }
    }
    rest.parse::<u32>().map(|n| Some(RawOperand::Int(n))).map_err(|_| bad("expected an integer"))
}

struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
}

impl LiteralParser {
    fn skip_ws(&mut self) {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn literal(&mut self) -> Result<RawConst, String> {
        self.skip_ws();
        match self.chars.get(self.pos).copied() {
            Some('"') => self.string().map(|s| RawConst::Value(Constant::Str(s))),
            Some('(') => self.tuple(),
            Some(_) => {
                let start = self.pos;
                while self
                    .chars
                    .get(self.pos)
                    .is_some_and(|c| !c.is_whitespace() && *c != ',' && *c != ')')
                {
                    self.pos += 1;
                }
                let word: String = self.chars[start..self.pos].iter().collect();
                Self::word(&word)
            }
            None => Err("expected a literal".into()),
        }
    }

    fn word(word: &str) -> Result<RawConst, String> {
        if let Some(name) = word.strip_prefix("code:") {
            return Ok(RawConst::Code(name.to_string()));
        }
        let constant = match word {
            "None" => Constant::None,
            "True" => Constant::Bool(true),
            "False" => Constant::Bool(false),
            _ if word.contains('.') => {
                Constant::Float(word.parse().map_err(|_| format!("invalid float '{}'", word))?)
            }
            _ => Constant::Int(word.parse().map_err(|_| format!("invalid literal '{}'", word))?),
        };
        Ok(RawConst::Value(constant))
    }

    fn string(&mut self) -> Result<String, String> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let ch = self.chars.get(self.pos).copied().ok_or("unterminated string")?;
            self.pos += 1;
            match ch {
                '"' => return Ok(out),
                '\\' => {
                    let esc = self.chars.get(self.pos).copied().ok_or("unterminated escape")?;
                    self.pos += 1;
                    out.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        '0' => '\0',
                        other => other,
                    });
                }
                other => out.push(other),
            }
        }
    }

    fn tuple(&mut self) -> Result<RawConst, String> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.chars.get(self.pos) {
                Some(')') => {
                    self.pos += 1;
                    return Ok(RawConst::Tuple(items));
                }
                Some(',') => self.pos += 1,
                Some(_) => items.push(self.literal()?),
                None => return Err("unterminated tuple".into()),
            }
        }
    }
}

struct Linker {
    blocks: HashMap<String, RawCode>,
    done: HashMap<String, Rc<CodeObject>>,
    active: Vec<String>,
}

impl Linker {
    fn build(&mut self, name: &str, line: usize) -> Result<Rc<CodeObject>, AsmError> {
        if let Some(code) = self.done.get(name) {
            return Ok(Rc::clone(code));
        }
        if self.active.iter().any(|n| n == name) {
            return Err(AsmError::RecursiveCode { name: name.to_string() });
        }
        let raw = self
            .blocks
            .remove(name)
            .ok_or_else(|| AsmError::UnknownCode { name: name.to_string(), line })?;
        self.active.push(name.to_string());

        let mut names = NameTable::new();
        let mut varnames = NameTable::with_names(&raw.args);
        let mut consts: Vec<Constant> = Vec::new();
        let mut instructions = Vec::with_capacity(raw.instrs.len());

        for (index, instr) in raw.instrs.iter().enumerate() {
            let arg = match &instr.operand {
                None => 0,
                Some(RawOperand::Int(n)) => *n,
                Some(RawOperand::Name(n)) => names.intern(n),
                Some(RawOperand::Var(n)) => varnames.intern(n),
                Some(RawOperand::Label(label)) => {
                    let target = *raw.labels.get(label).ok_or_else(|| AsmError::UnknownLabel {
                        label: label.clone(),
                        line: instr.source_line,
                    })?;
                    if instr.op.has_relative_target() {
                        target.checked_sub(index + 1).ok_or_else(|| AsmError::BadOperand {
                            text: format!("@{}", label),
                            line: instr.source_line,
                            reason: "relative jumps only go forward".into(),
                        })? as u32
                    } else {
                        target as u32
                    }
                }
                Some(RawOperand::Const(raw_const)) => {
                    let constant = self.constant(raw_const, instr.source_line)?;
                    match consts.iter().position(|c| *c == constant) {
                        Some(pos) => pos as u32,
                        None => {
                            consts.push(constant);
                            (consts.len() - 1) as u32
                        }
                    }
                }
            };
            instructions.push(Instruction::at_line(instr.op, arg, instr.line));
        }

        self.active.pop();
        let code = Rc::new(CodeObject {
            name: raw.name.clone(),
            filename: raw.filename,
            first_line: raw.first_line,
            argcount: raw.args.len() as u32,
            varnames: varnames.into_names(),
            names: names.into_names(),
            consts,
            instructions,
        });
        self.done.insert(raw.name, Rc::clone(&code));
        Ok(code)
    }

    fn constant(&mut self, raw: &RawConst, line: usize) -> Result<Constant, AsmError> {
        Ok(match raw {
            RawConst::Value(c) => c.clone(),
            RawConst::Tuple(items) => {
                Constant::Tuple(items.iter().map(|i| self.constant(i, line)).collect::<Result<_, _>>()?)
            }
            RawConst::Code(name) => Constant::Code(self.build(name, line)?),
        })
    }
}

/// Render a code object (and the code constants it holds) in assembler syntax.
pub fn disassemble(code: &CodeObject) -> String {
    let mut out = String::new();
    let mut pending = vec![code];
    let mut seen: Vec<String> = Vec::new();
    while let Some(code) = pending.pop() {
        if seen.contains(&code.name) {
            continue;
        }
        seen.push(code.name.clone());
        render_code(code, &mut out);
        for constant in code.consts.iter().rev() {
            if let Constant::Code(inner) = constant {
                pending.push(inner);
            }
        }
    }
    out
}

fn render_code(code: &CodeObject, out: &mut String) {
    let _ = writeln!(out, ".code {}", code.name);
    let _ = writeln!(out, ".file \"{}\"", code.filename);
    if code.argcount > 0 {
        let args = &code.varnames[..code.argcount as usize];
        let _ = writeln!(out, ".args {}", args.join(" "));
    }
    let targets: Vec<usize> = code
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(i, instr)| instr.jump_target(i))
        .collect();
    let mut line = None;
    for (index, instr) in code.instructions.iter().enumerate() {
        if line != Some(instr.line) {
            let _ = writeln!(out, ".line {}", instr.line);
            line = Some(instr.line);
        }
        if targets.contains(&index) {
            let _ = writeln!(out, "L{}:", index);
        }
        let _ = writeln!(out, "    {}", render_instruction(code, index, instr));
    }
    if targets.contains(&code.instructions.len()) {
        let _ = writeln!(out, "L{}:", code.instructions.len());
    }
    let _ = writeln!(out, ".end\n");
}

fn render_instruction(code: &CodeObject, index: usize, instr: &Instruction) -> String {
    let op = instr.op;
    let operand = if let Some(target) = instr.jump_target(index) {
        format!("@L{}", target)
    } else if op.uses_name() {
        code.name_at(instr.arg).unwrap_or("?").to_string()
    } else if op.uses_varname() {
        code.varname_at(instr.arg).unwrap_or("?").to_string()
    } else if op == OpCode::LoadConst {
        code.consts.get(instr.arg as usize).map(render_constant).unwrap_or_else(|| "None".into())
    } else if op == OpCode::CompareOp {
        CompareOp::from_arg(instr.arg).map(|c| c.symbol().to_string()).unwrap_or_else(|| instr.arg.to_string())
    } else if instr.arg != 0 || op.is_call() || op == OpCode::UnpackSequence {
        instr.arg.to_string()
    } else {
        String::new()
    };
    if operand.is_empty() {
        op.name().to_string()
    } else {
        format!("{} {}", op.name(), operand)
    }
}

fn render_constant(constant: &Constant) -> String {
    match constant {
        Constant::None => "None".into(),
        Constant::Bool(true) => "True".into(),
        Constant::Bool(false) => "False".into(),
        Constant::Int(n) => n.to_string(),
        Constant::Float(f) => format!("{:?}", f),
        Constant::Str(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")),
        Constant::Tuple(items) => {
            let inner: Vec<String> = items.iter().map(render_constant).collect();
            format!("({})", inner.join(", "))
        }
        Constant::Code(code) => format!("code:{}", code.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
; read and run
.code <module>
.line 1
    LOAD_NAME input
    CALL_FUNCTION 0
    STORE_NAME data
.line 2
    LOAD_NAME data
    POP_JUMP_IF_FALSE @done
    LOAD_CONST code:greet
    LOAD_CONST "greet"
    MAKE_FUNCTION 0
    STORE_NAME greet
done:
    LOAD_CONST None
    RETURN_VALUE
.end

.code greet
.args name
    LOAD_FAST name
    LOAD_CONST ("a", 1, None)
    COMPARE_OP ==
    RETURN_VALUE
.end
"#;

    #[test]
    fn test_assemble_resolves_names_labels_and_code_constants() {
        let code = assemble(SCRIPT, "main.py").expect("assembles");
        assert_eq!(code.name, "<module>");
        assert_eq!(code.filename, "main.py");
        assert_eq!(code.names, vec!["input", "data", "greet"]);
        let jump = code.instructions[4];
        assert_eq!(jump.op, OpCode::PopJumpIfFalse);
        assert_eq!(jump.arg, 9);
        assert_eq!(jump.line, 2);
        let greet = match &code.consts[0] {
            Constant::Code(c) => Rc::clone(c),
            other => panic!("expected code constant, got {:?}", other),
        };
        assert_eq!(greet.argcount, 1);
        assert_eq!(greet.varnames, vec!["name"]);
        assert_eq!(greet.instructions[2].arg, 2);
    }

    #[test]
    fn test_relative_jumps_are_encoded_as_forward_offsets() {
        let src = ".code m\n JUMP_FORWARD @end\n NOP\n NOP\nend:\n RETURN_VALUE\n";
        let code = assemble(src, "m.py").unwrap();
        assert_eq!(code.instructions[0].arg, 2);
        assert_eq!(code.instructions[0].jump_target(0), Some(3));
    }

    #[test]
    fn test_errors_carry_source_lines() {
        let err = assemble(".code m\n FROB 1\n", "m.py").unwrap_err();
        assert_eq!(err, AsmError::UnknownOpcode { name: "FROB".into(), line: 2 });
        let err = assemble(".code m\n JUMP_ABSOLUTE @nowhere\n", "m.py").unwrap_err();
        assert!(matches!(err, AsmError::UnknownLabel { .. }));
        let err = assemble(".code m\n LOAD_CONST code:m\n", "m.py").unwrap_err();
        assert!(matches!(err, AsmError::RecursiveCode { .. }));
    }

    #[test]
    fn test_comments_inside_strings_are_kept() {
        let code = assemble(".code m\n LOAD_CONST \"a;b#c\" ; trailing\n", "m.py").unwrap();
        assert_eq!(code.consts, vec![Constant::Str("a;b#c".into())]);
    }

    #[test]
    fn test_disassembly_reassembles_to_the_same_code() {
        let code = assemble(SCRIPT, "main.py").unwrap();
        let text = disassemble(&code);
        let again = assemble(&text, "main.py").unwrap();
        assert_eq!(again.instructions, code.instructions);
        assert_eq!(again.names, code.names);
    }
}
