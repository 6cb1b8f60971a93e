//! MPL compiler.
//!
//! Two-pass driver over logical source lines. Pass 1 collects function
//! bodies, chord and constant definitions and verifies structural balance;
//! pass 2 executes the top level, expanding blocks and `CALL`s and feeding
//! the sequence builder. Includes are spliced in before either pass so that
//! every line keeps its own file and line number for diagnostics.

pub mod channel;
pub mod length;
pub mod lexer;
pub mod options;

use crate::dict::{self, Dict, Keyword};
use crate::error::{Error, ErrorKind, ParseError, Result, Warning};
use crate::midi::event::MetaKind;
use crate::midi::sequence::{Sequence, SequenceBuilder, DEFAULT_RESOLUTION};
use channel::ChannelState;
use lexer::{classify, parse_channel, split_first_token, Line, LineKind};
use options::{parse_options, OptionFrame, Options};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Meta track carrying tempo, signatures, text and markers.
const TRACK_META: usize = 0;
/// Meta track carrying lyrics events.
const TRACK_LYRICS: usize = 2;

/// A user function: its body as token-preserving source lines.
#[derive(Debug, Clone)]
pub struct Function {
    pub body: Vec<Line>,
    pub file: Arc<PathBuf>,
    pub line: usize,
}

#[derive(Debug, Default)]
struct MetaBlock {
    copyright: Option<String>,
    title: Option<String>,
    composer: Option<String>,
    lyricist: Option<String>,
    artist: Option<String>,
    karaoke: Option<KaraokeBlock>,
}

#[derive(Debug, Default)]
struct KaraokeBlock {
    version: Option<String>,
    language: Option<String>,
    title: Option<String>,
    author: Option<String>,
    info: Option<String>,
}

/// Main compiler state.
pub struct Compiler {
    dict: Dict,
    resolution: u16,
    /// The sixteen channel states; index 9 is percussion.
    pub channels: [ChannelState; 16],
    functions: HashMap<String, Function>,
    chords: HashMap<String, Vec<u8>>,
    constants: HashMap<String, String>,
    variables: HashMap<String, String>,
    /// One entry per active block/call; records shadowed variable values.
    var_scopes: Vec<Vec<(String, Option<String>)>>,
    call_stack: Vec<String>,
    seq: SequenceBuilder,
    warnings: Vec<Warning>,
    instruments_seen: bool,
    include_dir: PathBuf,
    included: HashSet<PathBuf>,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            dict: Dict::new(),
            resolution: DEFAULT_RESOLUTION,
            channels: std::array::from_fn(|_| ChannelState::default()),
            functions: HashMap::new(),
            chords: HashMap::new(),
            constants: HashMap::new(),
            variables: HashMap::new(),
            var_scopes: Vec::new(),
            call_stack: Vec::new(),
            seq: SequenceBuilder::new(DEFAULT_RESOLUTION),
            warnings: Vec::new(),
            instruments_seen: false,
            include_dir: PathBuf::from("inc"),
            included: HashSet::new(),
        }
    }

    /// Set the directory used to resolve bare `INCLUDE` names.
    pub fn set_include_dir(&mut self, dir: impl Into<PathBuf>) {
        self.include_dir = dir.into();
    }

    pub fn resolution(&self) -> u16 {
        self.resolution
    }

    /// Warnings collected by the last successful compilation.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Compile MPL source from a reader. Includes resolve relative to the
    /// current directory.
    pub fn compile<R: Read>(&mut self, mut input: R) -> Result<Sequence> {
        let mut text = String::new();
        input.read_to_string(&mut text)?;
        let file = Arc::new(PathBuf::from("<input>"));
        let lines = lexer::logical_lines(&text, &file)?;
        self.run(lines, None)
    }

    /// Compile an MPL file. `INCLUDEFILE` paths resolve relative to the
    /// including file.
    pub fn compile_file(&mut self, path: &Path) -> Result<Sequence> {
        let text = fs::read_to_string(path).map_err(|e| file_error(path, 0, e))?;
        let file = Arc::new(path.to_path_buf());
        let lines = lexer::logical_lines(&text, &file)?;
        self.run(lines, fs::canonicalize(path).ok())
    }

    fn run(&mut self, lines: Vec<Line>, root: Option<PathBuf>) -> Result<Sequence> {
        self.reset();
        let mut open = Vec::new();
        if let Some(canonical) = root {
            self.included.insert(canonical.clone());
            open.push(canonical);
        }
        let lines = self.resolve_includes(lines, &mut open)?;
        self.pass1(&lines)?;
        self.pass2(&lines)?;
        let seq = std::mem::replace(&mut self.seq, SequenceBuilder::new(self.resolution));
        Ok(seq.finish())
    }

    fn reset(&mut self) {
        self.dict = Dict::new();
        self.channels = std::array::from_fn(|_| ChannelState::default());
        self.functions.clear();
        self.chords.clear();
        self.constants.clear();
        self.variables.clear();
        self.var_scopes.clear();
        self.call_stack.clear();
        self.seq = SequenceBuilder::new(self.resolution);
        self.warnings.clear();
        self.instruments_seen = false;
        self.included.clear();
    }

    // ------------------------------------------------------------------
    // Include resolution
    // ------------------------------------------------------------------

    /// Splice `INCLUDE`/`INCLUDEFILE` targets in place of their directive
    /// line. Only allowed at nesting depth zero; cycles are detected
    /// against the open-set stack, repeated imports of the same file are
    /// skipped.
    fn resolve_includes(
        &mut self,
        lines: Vec<Line>,
        open: &mut Vec<PathBuf>,
    ) -> std::result::Result<Vec<Line>, ParseError> {
        let mut resolved = Vec::with_capacity(lines.len());
        let mut depth = 0usize;

        for line in lines {
            let kind = classify(&line, &self.dict);
            match kind {
                LineKind::FunctionOpen
                | LineKind::BlockOpen
                | LineKind::Instruments
                | LineKind::Meta
                | LineKind::SoftKaraoke => depth += 1,
                LineKind::End | LineKind::BlockClose => depth = depth.saturating_sub(1),
                LineKind::Include | LineKind::IncludeFile => {
                    if depth > 0 {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "INCLUDE is only allowed at the top level",
                        ));
                    }
                    let (_, param) = split_first_token(&line.text);
                    let param = param.trim();
                    if param.is_empty() {
                        return Err(line.error(ErrorKind::IncludeFailure, "missing include path"));
                    }
                    let target = if kind == LineKind::Include {
                        self.include_dir.join(param)
                    } else {
                        match line.file.parent() {
                            Some(parent) if !parent.as_os_str().is_empty() => parent.join(param),
                            _ => PathBuf::from(param),
                        }
                    };
                    let mut included = self.load_include(&line, &target, open)?;
                    resolved.append(&mut included);
                    continue;
                }
                _ => {}
            }
            resolved.push(line);
        }

        Ok(resolved)
    }

    fn load_include(
        &mut self,
        line: &Line,
        target: &Path,
        open: &mut Vec<PathBuf>,
    ) -> std::result::Result<Vec<Line>, ParseError> {
        let canonical = fs::canonicalize(target).map_err(|_| {
            line.error(
                ErrorKind::FileNotFound,
                format!("cannot find include file '{}'", target.display()),
            )
        })?;

        if open.contains(&canonical) {
            return Err(line.error(
                ErrorKind::IncludeCycle,
                format!("include cycle through '{}'", target.display()),
            ));
        }
        if !self.included.insert(canonical.clone()) {
            // Already imported once.
            return Ok(Vec::new());
        }

        let text = fs::read_to_string(&canonical).map_err(|e| {
            line.error(
                ErrorKind::IncludeFailure,
                format!("cannot read '{}': {}", target.display(), e),
            )
        })?;

        let file = Arc::new(target.to_path_buf());
        let lines = lexer::logical_lines(&text, &file)?;

        open.push(canonical);
        let resolved = self.resolve_includes(lines, open);
        open.pop();
        resolved
    }

    // ------------------------------------------------------------------
    // Pass 1: structure and definitions
    // ------------------------------------------------------------------

    fn pass1(&mut self, lines: &[Line]) -> std::result::Result<(), ParseError> {
        enum Opener {
            Function { name: String, body_start: usize },
            Block,
            Instruments,
            Meta,
            SoftKaraoke,
        }

        let mut stack: Vec<(Opener, usize)> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            let kind = classify(line, &self.dict);
            let in_instruments = matches!(stack.last(), Some((Opener::Instruments, _)));
            let in_meta = matches!(
                stack.last(),
                Some((Opener::Meta, _)) | Some((Opener::SoftKaraoke, _))
            );

            match kind {
                LineKind::FunctionOpen => {
                    if !stack.is_empty() {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "function definition is only allowed at the top level",
                        ));
                    }
                    let (_, rest) = split_first_token(&line.text);
                    let (name, extra) = split_first_token(rest);
                    if name.is_empty() {
                        return Err(
                            line.error(ErrorKind::BadOption, "function definition needs a name")
                        );
                    }
                    if !extra.is_empty() {
                        return Err(line.error(
                            ErrorKind::BadOption,
                            "function definition takes a single name",
                        ));
                    }
                    if self.functions.contains_key(name) {
                        return Err(line.error(
                            ErrorKind::Redefinition,
                            format!("function '{}' already defined", name),
                        ));
                    }
                    stack.push((
                        Opener::Function {
                            name: name.to_string(),
                            body_start: idx + 1,
                        },
                        idx,
                    ));
                }
                LineKind::End => {
                    let (_, rest) = split_first_token(&line.text);
                    if !rest.is_empty() {
                        return Err(line.error(ErrorKind::BadOption, "END takes no parameter"));
                    }
                    match stack.pop() {
                        None => {
                            return Err(line.error(ErrorKind::StructuralMismatch, "unmatched END"))
                        }
                        Some((Opener::Function { name, body_start }, _)) => {
                            let body = lines[body_start..idx].to_vec();
                            self.functions.insert(
                                name,
                                Function {
                                    body,
                                    file: Arc::clone(&line.file),
                                    line: line.number,
                                },
                            );
                        }
                        Some((Opener::Block, open_idx)) => {
                            return Err(line.error(
                                ErrorKind::StructuralMismatch,
                                format!(
                                    "END cannot close the block opened at line {}",
                                    lines[open_idx].number
                                ),
                            ));
                        }
                        Some((Opener::Instruments | Opener::Meta | Opener::SoftKaraoke, _)) => {}
                    }
                }
                LineKind::BlockOpen => {
                    if in_instruments || in_meta {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "blocks are not allowed here",
                        ));
                    }
                    stack.push((Opener::Block, idx));
                }
                LineKind::BlockClose => match stack.pop() {
                    Some((Opener::Block, _)) => {}
                    _ => {
                        return Err(line.error(ErrorKind::StructuralMismatch, "unmatched '}'"));
                    }
                },
                LineKind::Instruments => {
                    if !stack.is_empty() {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "INSTRUMENTS is only allowed at the top level",
                        ));
                    }
                    let (_, rest) = split_first_token(&line.text);
                    if !rest.is_empty() {
                        return Err(
                            line.error(ErrorKind::BadOption, "INSTRUMENTS takes no parameter")
                        );
                    }
                    self.instruments_seen = true;
                    stack.push((Opener::Instruments, idx));
                }
                LineKind::Meta => {
                    if !stack.is_empty() {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "META is only allowed at the top level",
                        ));
                    }
                    let (_, rest) = split_first_token(&line.text);
                    if !rest.is_empty() {
                        return Err(line.error(ErrorKind::BadOption, "META takes no parameter"));
                    }
                    stack.push((Opener::Meta, idx));
                }
                LineKind::SoftKaraoke => {
                    if !matches!(stack.last(), Some((Opener::Meta, _))) {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "SOFT_KARAOKE is only allowed inside META",
                        ));
                    }
                    stack.push((Opener::SoftKaraoke, idx));
                }
                LineKind::Chord => {
                    if !stack.is_empty() {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "CHORD is only allowed at the top level",
                        ));
                    }
                    self.define_chord(line)?;
                }
                LineKind::Const => {
                    if !stack.is_empty() {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "CONST is only allowed at the top level",
                        ));
                    }
                    self.define_const(line)?;
                }
                LineKind::Define => {
                    if !stack.is_empty() {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "DEFINE is only allowed at the top level",
                        ));
                    }
                    self.define_symbol(line)?;
                }
                LineKind::Var => {
                    if in_instruments {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "variables are not allowed inside INSTRUMENTS",
                        ));
                    }
                    if in_meta {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "variables are not allowed inside META",
                        ));
                    }
                }
                LineKind::Global(_) => {
                    if !stack.is_empty() {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "global commands are only allowed at the top level",
                        ));
                    }
                }
                LineKind::Call => {
                    if in_instruments || in_meta {
                        return Err(line.error(
                            ErrorKind::ContextViolation,
                            "CALL is not allowed here",
                        ));
                    }
                }
                LineKind::Include | LineKind::IncludeFile => {
                    // Spliced away before this pass.
                }
                LineKind::ChannelCmd | LineKind::Deferred => {}
                LineKind::Unknown => {
                    if !in_instruments && !in_meta {
                        let (first, _) = split_first_token(&line.text);
                        return Err(line.error(
                            ErrorKind::UnknownToken,
                            format!("unknown command '{}'", first),
                        ));
                    }
                }
            }
        }

        if let Some((_, open_idx)) = stack.last() {
            return Err(lines[*open_idx].error(
                ErrorKind::StructuralMismatch,
                "block or definition still open at end of file",
            ));
        }

        Ok(())
    }

    fn define_chord(&mut self, line: &Line) -> std::result::Result<(), ParseError> {
        let (_, rest) = split_first_token(&line.text);
        let (name, notes_text) = match rest.find('=') {
            Some(pos) => (rest[..pos].trim(), rest[pos + 1..].trim()),
            None => {
                return Err(line.error(ErrorKind::BadOption, "chord definition needs '='"));
            }
        };
        if name.is_empty() {
            return Err(line.error(ErrorKind::BadOption, "chord definition needs a name"));
        }
        if notes_text.is_empty() {
            return Err(line.error(ErrorKind::BadOption, "chord definition needs notes"));
        }
        if self.chords.contains_key(name) || self.dict.collides(name) {
            return Err(line.error(
                ErrorKind::Redefinition,
                format!("chord name '{}' collides with an existing name", name),
            ));
        }

        let notes_text = self.expand_consts(notes_text, line)?;
        let mut notes = Vec::new();
        for token in notes_text.split(',') {
            let token = token.trim();
            let note = self.resolve_single_note(token, line)?;
            if notes.contains(&note) {
                return Err(line.error(
                    ErrorKind::BadOption,
                    format!("duplicate note '{}' in chord", token),
                ));
            }
            notes.push(note);
        }

        self.chords.insert(name.to_string(), notes);
        Ok(())
    }

    fn define_const(&mut self, line: &Line) -> std::result::Result<(), ParseError> {
        let (_, rest) = split_first_token(&line.text);
        let (name, value) = split_assignment(rest).ok_or_else(|| {
            line.error(ErrorKind::BadOption, "constant definition needs '$name = value'")
        })?;
        if self.constants.contains_key(&name) {
            return Err(line.error(
                ErrorKind::Redefinition,
                format!("constant '{}' already defined", name),
            ));
        }
        let value = self.expand_consts(&value, line)?;
        self.constants.insert(name, value);
        Ok(())
    }

    fn define_symbol(&mut self, line: &Line) -> std::result::Result<(), ParseError> {
        let (_, rest) = split_first_token(&line.text);
        let (id, symbol) = match rest.find('=') {
            Some(pos) => (rest[..pos].trim(), rest[pos + 1..].trim()),
            None => {
                let (id, symbol) = split_first_token(rest);
                (id, symbol.trim())
            }
        };
        if id.is_empty() || symbol.is_empty() || symbol.split_whitespace().count() != 1 {
            return Err(line.error(ErrorKind::BadOption, "DEFINE needs an id and one symbol"));
        }
        if !self.dict.redefine(id, symbol) {
            return Err(line.error(
                ErrorKind::UnknownToken,
                format!("unknown keyword id '{}'", id),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pass 2: execution
    // ------------------------------------------------------------------

    fn pass2(&mut self, lines: &[Line]) -> std::result::Result<(), ParseError> {
        let frame = OptionFrame::root();
        self.exec_lines(lines, &frame)
    }

    fn exec_lines(
        &mut self,
        lines: &[Line],
        frame: &OptionFrame,
    ) -> std::result::Result<(), ParseError> {
        let mut i = 0;
        while i < lines.len() {
            let line = &lines[i];
            match classify(line, &self.dict) {
                LineKind::FunctionOpen => {
                    i = skip_to_end(lines, i, &self.dict) + 1;
                }
                LineKind::Instruments => {
                    let end = skip_to_end(lines, i, &self.dict);
                    self.exec_instruments(&lines[i + 1..end])?;
                    i = end + 1;
                }
                LineKind::Meta => {
                    let end = skip_to_end(lines, i, &self.dict);
                    self.exec_meta(&lines[i + 1..end])?;
                    i = end + 1;
                }
                LineKind::BlockOpen => {
                    let close = find_block_close(lines, i, &self.dict);
                    let mut opts = self.header_options(line, LineKind::BlockOpen)?;
                    let close_opts = self.header_options(&lines[close], LineKind::BlockClose)?;
                    opts.merge(close_opts)
                        .map_err(|(kind, msg)| lines[close].error(kind, msg))?;
                    self.check_block_options(line, &opts)?;
                    self.exec_body(&lines[i + 1..close], &opts, frame)?;
                    i = close + 1;
                }
                LineKind::Call => {
                    self.exec_call(line, frame)?;
                    i += 1;
                }
                LineKind::Global(kw) => {
                    self.exec_global(line, kw)?;
                    i += 1;
                }
                LineKind::Var => {
                    self.exec_var(line)?;
                    i += 1;
                }
                LineKind::ChannelCmd => {
                    let text = self.expand_refs(&line.text, line)?;
                    self.exec_channel_cmd(line, &text, frame)?;
                    i += 1;
                }
                LineKind::Deferred => {
                    self.exec_deferred(line, frame)?;
                    i += 1;
                }
                LineKind::Chord | LineKind::Const | LineKind::Define => {
                    // Handled in pass 1.
                    i += 1;
                }
                LineKind::Include | LineKind::IncludeFile => {
                    i += 1;
                }
                LineKind::End | LineKind::BlockClose => {
                    return Err(
                        line.error(ErrorKind::StructuralMismatch, "unexpected block close")
                    );
                }
                LineKind::SoftKaraoke => {
                    return Err(line.error(
                        ErrorKind::ContextViolation,
                        "SOFT_KARAOKE is only allowed inside META",
                    ));
                }
                LineKind::Unknown => {
                    let (first, _) = split_first_token(&line.text);
                    return Err(line.error(
                        ErrorKind::UnknownToken,
                        format!("unknown command '{}'", first),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Execute a line whose first token is a `$name` reference.
    fn exec_deferred(
        &mut self,
        line: &Line,
        frame: &OptionFrame,
    ) -> std::result::Result<(), ParseError> {
        let text = self.expand_refs(&line.text, line)?;
        let expanded = Line {
            file: Arc::clone(&line.file),
            number: line.number,
            text,
        };
        match classify(&expanded, &self.dict) {
            LineKind::ChannelCmd => self.exec_channel_cmd(line, &expanded.text, frame),
            LineKind::Call => self.exec_call(&expanded, frame),
            LineKind::Global(kw) => self.exec_global(&expanded, kw),
            LineKind::Var => self.exec_var(&expanded),
            _ => Err(line.error(
                ErrorKind::UnknownToken,
                format!("expansion yields no executable command: '{}'", expanded.text),
            )),
        }
    }

    /// Parse the option list of a `{` or `}` header line.
    fn header_options(
        &self,
        line: &Line,
        kind: LineKind,
    ) -> std::result::Result<Options, ParseError> {
        let brace = if kind == LineKind::BlockOpen { '{' } else { '}' };
        let text = line.text.trim_start();
        let rest = text.strip_prefix(brace).unwrap_or(text);
        let rest = self.expand_refs(rest, line)?;
        parse_options(&rest, &self.dict).map_err(|(kind, msg)| line.error(kind, msg))
    }

    fn check_block_options(
        &self,
        line: &Line,
        opts: &Options,
    ) -> std::result::Result<(), ParseError> {
        if opts.lyrics.is_some() || opts.tremolo.is_some() {
            return Err(line.error(
                ErrorKind::BadOption,
                "only v, d, s, q and m are allowed on a block or CALL",
            ));
        }
        Ok(())
    }

    /// Execute a block or function body `q` times under a child frame,
    /// restoring the tick snapshot afterwards when `m` is set.
    fn exec_body(
        &mut self,
        body: &[Line],
        opts: &Options,
        parent: &OptionFrame,
    ) -> std::result::Result<(), ParseError> {
        let child = parent.child(opts);
        let quantity = opts.quantity.unwrap_or(1);
        let snapshot: [u64; 16] = std::array::from_fn(|c| self.channels[c].current_tick);

        self.var_scopes.push(Vec::new());
        let result = (0..quantity).try_for_each(|_| self.exec_lines(body, &child));
        let scope = self.var_scopes.pop().unwrap_or_default();
        for (name, previous) in scope.into_iter().rev() {
            match previous {
                Some(value) => self.variables.insert(name, value),
                None => self.variables.remove(&name),
            };
        }
        result?;

        if opts.multiple {
            for (c, tick) in snapshot.iter().enumerate() {
                self.channels[c].current_tick = *tick;
            }
        }
        Ok(())
    }

    fn exec_call(&mut self, line: &Line, frame: &OptionFrame) -> std::result::Result<(), ParseError> {
        let (_, rest) = split_first_token(&line.text);
        let rest = self.expand_refs(rest, line)?;
        let (name, opts_text) = match rest.find(',') {
            Some(pos) => (rest[..pos].trim(), &rest[pos + 1..]),
            None => (rest.trim(), ""),
        };
        if name.is_empty() || name.split_whitespace().count() != 1 {
            return Err(line.error(ErrorKind::BadOption, "CALL needs a function name"));
        }

        let opts = parse_options(opts_text, &self.dict)
            .map_err(|(kind, msg)| line.error(kind, msg))?;
        self.check_block_options(line, &opts)?;

        if self.call_stack.iter().any(|n| n == name) {
            return Err(line.error(
                ErrorKind::RecursiveCall,
                format!("recursive call of function '{}'", name),
            ));
        }
        let function = self.functions.get(name).ok_or_else(|| {
            line.error(
                ErrorKind::UnknownToken,
                format!("function '{}' is not defined", name),
            )
        })?;
        let body = function.body.clone();

        self.call_stack.push(name.to_string());
        let result = self.exec_body(&body, &opts, frame);
        self.call_stack.pop();
        result
    }

    fn exec_var(&mut self, line: &Line) -> std::result::Result<(), ParseError> {
        let (_, rest) = split_first_token(&line.text);
        let (name, value) = split_assignment(rest).ok_or_else(|| {
            line.error(ErrorKind::BadOption, "variable assignment needs '$name = value'")
        })?;
        if self.constants.contains_key(&name) {
            return Err(line.error(
                ErrorKind::Redefinition,
                format!("'{}' is already defined as a constant", name),
            ));
        }
        let value = self.expand_refs(&value, line)?;

        // Record the shadowed value once per scope for restoration.
        if let Some(scope) = self.var_scopes.last_mut() {
            if !scope.iter().any(|(n, _)| n == &name) {
                scope.push((name.clone(), self.variables.get(&name).cloned()));
            }
        }
        self.variables.insert(name, value);
        Ok(())
    }

    fn exec_global(&mut self, line: &Line, kw: Keyword) -> std::result::Result<(), ParseError> {
        let (_, rest) = split_first_token(&line.text);
        let param = self.expand_refs(rest.trim(), line)?;
        if param.is_empty() {
            return Err(line.error(ErrorKind::BadOption, "global command needs a value"));
        }

        // Synchronize the channels that are in use; an untouched channel
        // keeps its tick until its first own command.
        let tick = self
            .channels
            .iter()
            .filter(|c| c.used)
            .map(|c| c.current_tick)
            .max()
            .unwrap_or(0);

        match kw {
            Keyword::Tempo => {
                let bpm: u32 = param
                    .parse()
                    .ok()
                    .filter(|&b| b > 0)
                    .ok_or_else(|| {
                        line.error(ErrorKind::BadOption, format!("invalid tempo '{}'", param))
                    })?;
                let mpq = 60_000_000 / bpm;
                let data = vec![(mpq >> 16) as u8, (mpq >> 8) as u8, mpq as u8];
                self.seq.emit_meta(TRACK_META, MetaKind::SetTempo, data, tick);
            }
            Keyword::Time => {
                let (num, den) = param.split_once('/').ok_or_else(|| {
                    line.error(
                        ErrorKind::BadOption,
                        format!("invalid time signature '{}'", param),
                    )
                })?;
                let num: u8 = num.trim().parse().map_err(|_| {
                    line.error(
                        ErrorKind::BadOption,
                        format!("invalid time signature '{}'", param),
                    )
                })?;
                let den: u16 = den.trim().parse().map_err(|_| {
                    line.error(
                        ErrorKind::BadOption,
                        format!("invalid time signature '{}'", param),
                    )
                })?;
                if num == 0 || den == 0 || !den.is_power_of_two() {
                    return Err(line.error(
                        ErrorKind::BadOption,
                        format!("invalid time signature '{}'", param),
                    ));
                }
                let exponent = den.trailing_zeros() as u8;
                let data = vec![num, exponent, 24, 8];
                self.seq.emit_meta(TRACK_META, MetaKind::TimeSig, data, tick);
            }
            Keyword::Key => {
                let (note, mode) = param.split_once('/').ok_or_else(|| {
                    line.error(
                        ErrorKind::BadOption,
                        format!("invalid key signature '{}'", param),
                    )
                })?;
                let note_num = dict::parse_note(note.trim()).ok_or_else(|| {
                    line.error(ErrorKind::UnknownNote, format!("unknown note '{}'", note))
                })?;
                let minor = match mode.trim().to_lowercase().as_str() {
                    "maj" | "major" => false,
                    "min" | "minor" => true,
                    other => {
                        return Err(line.error(
                            ErrorKind::BadOption,
                            format!("unknown key mode '{}'", other),
                        ));
                    }
                };
                let sharps = dict::key_signature(note_num % 12, minor);
                let data = vec![sharps as u8, minor as u8];
                self.seq.emit_meta(TRACK_META, MetaKind::KeySig, data, tick);
            }
            _ => unreachable!("not a global command"),
        }

        for channel in self.channels.iter_mut().filter(|c| c.used) {
            channel.current_tick = tick;
        }
        Ok(())
    }

    fn exec_channel_cmd(
        &mut self,
        line: &Line,
        text: &str,
        frame: &OptionFrame,
    ) -> std::result::Result<(), ParseError> {
        let (ch_token, rest) = split_first_token(text);
        let channel = parse_channel(ch_token).ok_or_else(|| {
            line.error(
                ErrorKind::UnknownToken,
                format!("invalid channel '{}'", ch_token),
            )
        })?;

        let (note_token, rest) = split_first_token(rest);
        if note_token.is_empty() {
            return Err(line.error(ErrorKind::UnknownNote, "missing note"));
        }

        let (length_raw, tail) = split_first_token(rest);
        let (length_token, opts_text) = match length_raw.find(',') {
            Some(pos) => (
                &length_raw[..pos],
                format!("{} {}", &length_raw[pos + 1..], tail),
            ),
            None => (length_raw, tail.to_string()),
        };
        if length_token.is_empty() {
            return Err(line.error(ErrorKind::BadLength, "missing note length"));
        }

        let opts = parse_options(&opts_text, &self.dict)
            .map_err(|(kind, msg)| line.error(kind, msg))?;

        let length = length::parse_duration(length_token, self.resolution)
            .map_err(|msg| line.error(ErrorKind::BadLength, msg))?;

        let is_rest = self.dict.is_rest(note_token);
        let notes = if is_rest {
            Vec::new()
        } else {
            self.resolve_notes(channel, note_token, line)?
        };

        if channel != 9 && self.instruments_seen && !self.channels[channel as usize].declared {
            return Err(line.error(
                ErrorKind::UnknownChannelUse,
                format!("channel {} is not declared in INSTRUMENTS", channel),
            ));
        }

        self.channels[channel as usize].used = true;

        // Sticky defaults: explicit options win, then the enclosing frame.
        if let Some(v) = opts.velocity.or(frame.velocity) {
            self.channels[channel as usize].velocity = v;
        }
        if let Some(d) = opts.duration.or(frame.duration) {
            self.channels[channel as usize].duration_ratio = d;
        }
        // `s` on the command itself adds to the channel's sticky shift and
        // stays in effect afterwards; header shifts live on the frame chain
        // and end with their scope.
        if let Some(s) = opts.shift {
            self.channels[channel as usize].octave_shift += s;
        }
        let shift = self.channels[channel as usize].octave_shift + frame.shift;

        let quantity = opts.quantity.unwrap_or(1);
        let start_snapshot = self.channels[channel as usize].current_tick;

        if quantity == 0 {
            // Emits nothing, but the bookkeeping advance still happens.
            self.warn(line, "quantity 0: nothing emitted");
            self.channels[channel as usize].current_tick += length;
        }

        for _ in 0..quantity {
            let start = self.channels[channel as usize].current_tick;

            if let Some(lyrics) = &opts.lyrics {
                self.seq.emit_meta(
                    TRACK_LYRICS,
                    MetaKind::Lyrics,
                    lyrics.as_bytes().to_vec(),
                    start,
                );
            }

            if !is_rest {
                self.play_notes(line, channel, &notes, length, shift, &opts)?;
            }
            self.channels[channel as usize].current_tick = start + length;
        }

        if opts.multiple {
            self.channels[channel as usize].current_tick = start_snapshot;
        }
        Ok(())
    }

    /// Emit note-on/off pairs for one strike of a note or chord, including
    /// the tremolo subdivision.
    fn play_notes(
        &mut self,
        line: &Line,
        channel: u8,
        notes: &[u8],
        length: u64,
        shift: i32,
        opts: &Options,
    ) -> std::result::Result<(), ParseError> {
        let state = &self.channels[channel as usize];
        let velocity = state.velocity;
        let ratio = state.duration_ratio;
        let start = state.current_tick;

        let subdivisions = opts.tremolo.unwrap_or(1) as u64;
        if subdivisions > length {
            return Err(line.error(
                ErrorKind::BadOption,
                "tremolo has more subdivisions than ticks",
            ));
        }
        let sub_length = length / subdivisions;

        let mut shifted = Vec::with_capacity(notes.len());
        for &note in notes {
            let value = note as i32 + shift;
            let value = u8::try_from(value).ok().filter(|&v| v <= 127).ok_or_else(|| {
                line.error(
                    ErrorKind::UnknownNote,
                    format!("note {} shifted out of range", note),
                )
            })?;
            shifted.push(value);
        }

        let mut tick = start;
        for i in 0..subdivisions {
            // The last sub-note absorbs the division remainder.
            let current = if i == subdivisions - 1 {
                length - sub_length * (subdivisions - 1)
            } else {
                sub_length
            };
            let held = length::scale_ticks(current, ratio);
            if held == 0 {
                self.warn(line, "duration ratio shrinks the note to zero ticks");
            }
            for &note in &shifted {
                self.seq.emit_note_on(channel, note, velocity, tick);
            }
            for &note in &shifted {
                self.seq.emit_note_off(channel, note, tick + held);
            }
            tick += current;
        }
        Ok(())
    }

    /// Resolve a note column into the notes of a chord (a single note being
    /// a chord of size one).
    fn resolve_notes(
        &self,
        channel: u8,
        token: &str,
        line: &Line,
    ) -> std::result::Result<Vec<u8>, ParseError> {
        if let Some(notes) = self.chords.get(token) {
            if channel == 9 {
                return Err(line.error(
                    ErrorKind::UnknownNote,
                    "chords are not allowed in the percussion channel",
                ));
            }
            return Ok(notes.clone());
        }
        if channel == 9 {
            if let Some(note) = self.dict.percussion(token) {
                return Ok(vec![note]);
            }
            if let Ok(num) = token.parse::<u8>() {
                if num <= 127 {
                    return Ok(vec![num]);
                }
            }
            return Err(line.error(
                ErrorKind::UnknownNote,
                format!("unknown percussion instrument '{}'", token),
            ));
        }
        Ok(vec![self.resolve_single_note(token, line)?])
    }

    fn resolve_single_note(
        &self,
        token: &str,
        line: &Line,
    ) -> std::result::Result<u8, ParseError> {
        if let Some(note) = dict::parse_note(token) {
            return Ok(note);
        }
        if let Ok(num) = token.parse::<u8>() {
            if num <= 127 {
                return Ok(num);
            }
        }
        Err(line.error(
            ErrorKind::UnknownNote,
            format!("unknown note '{}'", token),
        ))
    }

    // ------------------------------------------------------------------
    // INSTRUMENTS and META blocks
    // ------------------------------------------------------------------

    fn exec_instruments(&mut self, entries: &[Line]) -> std::result::Result<(), ParseError> {
        for line in entries {
            let text = self.expand_consts(&line.text, line)?;
            let (ch_token, rest) = split_first_token(&text);
            let channel = parse_channel(ch_token).ok_or_else(|| {
                line.error(
                    ErrorKind::UnknownToken,
                    format!("invalid channel '{}'", ch_token),
                )
            })?;

            let (instr_token, name) = split_first_token(rest);
            if instr_token.is_empty() {
                return Err(line.error(ErrorKind::BadOption, "missing instrument"));
            }

            let (program, msb, lsb) = self.parse_instrument(channel, instr_token, line)?;
            let name = name.trim().to_string();

            let tick = self.channels[channel as usize].current_tick;
            let state = &mut self.channels[channel as usize];
            state.program = program;
            state.bank_msb = msb;
            state.bank_lsb = lsb;
            state.name = name.clone();
            state.declared = true;
            state.used = true;

            if msb != 0 || lsb != 0 {
                self.seq.emit_bank_select(channel, msb, lsb, tick);
            }
            if !name.is_empty() {
                self.seq.emit_instrument_name(channel, &name, tick);
            }
            self.seq.emit_program_change(channel, program, tick);
        }
        Ok(())
    }

    /// Parse the instrument column: `<program>[,<bank>]` or
    /// `<program>[,<MSB>/<LSB>]`, where `<program>` may be a GM instrument
    /// name, or a drumkit name on channel 9.
    fn parse_instrument(
        &self,
        channel: u8,
        token: &str,
        line: &Line,
    ) -> std::result::Result<(u8, u8, u8), ParseError> {
        let mut parts = token.split(',');
        let program_text = parts.next().unwrap_or_default();
        let bank_text = parts.next();
        if parts.next().is_some() {
            return Err(line.error(
                ErrorKind::BadOption,
                format!("too many ',' in instrument '{}'", token),
            ));
        }

        let program = if let Ok(num) = program_text.parse::<u16>() {
            if num > 127 {
                return Err(line.error(
                    ErrorKind::BankOutOfRange,
                    format!("program number {} out of range", num),
                ));
            }
            num as u8
        } else if channel == 9 {
            self.dict.drumkit(program_text).ok_or_else(|| {
                line.error(
                    ErrorKind::UnknownToken,
                    format!("unknown drumkit '{}'", program_text),
                )
            })?
        } else {
            self.dict.instrument(program_text).ok_or_else(|| {
                line.error(
                    ErrorKind::UnknownToken,
                    format!("unknown instrument '{}'", program_text),
                )
            })?
        };

        let (msb, lsb) = match bank_text {
            None => (0, 0),
            Some(bank) => {
                let mut split = bank.split('/');
                let first = split.next().unwrap_or_default();
                let second = split.next();
                if split.next().is_some() {
                    return Err(line.error(
                        ErrorKind::BadOption,
                        format!("too many '/' in bank '{}'", bank),
                    ));
                }
                let first: u32 = first.parse().map_err(|_| {
                    line.error(ErrorKind::BadOption, format!("invalid bank '{}'", bank))
                })?;
                match second {
                    // Full bank number, split into MSB and LSB.
                    None => {
                        if first > 16383 {
                            return Err(line.error(
                                ErrorKind::BankOutOfRange,
                                format!("bank number {} out of range", first),
                            ));
                        }
                        ((first / 128) as u8, (first % 128) as u8)
                    }
                    Some(second) => {
                        let second: u32 = second.parse().map_err(|_| {
                            line.error(ErrorKind::BadOption, format!("invalid bank '{}'", bank))
                        })?;
                        if first > 127 || second > 127 {
                            return Err(line.error(
                                ErrorKind::BankOutOfRange,
                                format!("bank MSB/LSB {} out of range", bank),
                            ));
                        }
                        (first as u8, second as u8)
                    }
                }
            }
        };

        Ok((program, msb, lsb))
    }

    fn exec_meta(&mut self, entries: &[Line]) -> std::result::Result<(), ParseError> {
        let mut meta = MetaBlock::default();
        let mut i = 0;

        while i < entries.len() {
            let line = &entries[i];
            if classify(line, &self.dict) == LineKind::SoftKaraoke {
                let end = skip_to_end(entries, i, &self.dict);
                meta.karaoke = Some(self.parse_karaoke(&entries[i + 1..end])?);
                i = end + 1;
                continue;
            }

            let (field, value) = split_first_token(&line.text);
            let slot = match field.to_lowercase().as_str() {
                "copyright" => &mut meta.copyright,
                "title" => &mut meta.title,
                "composer" => &mut meta.composer,
                "lyricist" => &mut meta.lyricist,
                "artist" => &mut meta.artist,
                other => {
                    return Err(line.error(
                        ErrorKind::UnknownToken,
                        format!("unknown META field '{}'", other),
                    ));
                }
            };
            append_field(slot, value);
            i += 1;
        }

        self.emit_meta_block(&meta);
        Ok(())
    }

    fn parse_karaoke(&self, entries: &[Line]) -> std::result::Result<KaraokeBlock, ParseError> {
        let mut karaoke = KaraokeBlock::default();
        for line in entries {
            let (field, value) = split_first_token(&line.text);
            let slot = match field.to_lowercase().as_str() {
                "version" => &mut karaoke.version,
                "language" => &mut karaoke.language,
                "title" => &mut karaoke.title,
                "author" => &mut karaoke.author,
                "info" => &mut karaoke.info,
                other => {
                    return Err(line.error(
                        ErrorKind::UnknownToken,
                        format!("unknown SOFT_KARAOKE field '{}'", other),
                    ));
                }
            };
            append_field(slot, value);
        }
        Ok(karaoke)
    }

    /// META block content: one ordered text meta event on track 0 at
    /// tick 0, carrying every field (and the soft-karaoke sub-block) as
    /// RP-026-style tags.
    fn emit_meta_block(&mut self, meta: &MetaBlock) {
        let mut tags = String::new();
        for (tag, value) in [
            ("copyright", &meta.copyright),
            ("title", &meta.title),
            ("composer", &meta.composer),
            ("lyrics", &meta.lyricist),
            ("artist", &meta.artist),
        ] {
            if let Some(value) = value {
                tags.push_str(&format!("{{#{}={}}}", tag, escape_tag(value)));
            }
        }
        if let Some(karaoke) = &meta.karaoke {
            for (tag, value) in [
                ("sk_version", &karaoke.version),
                ("sk_language", &karaoke.language),
                ("sk_title", &karaoke.title),
                ("sk_author", &karaoke.author),
                ("sk_info", &karaoke.info),
            ] {
                if let Some(value) = value {
                    tags.push_str(&format!("{{#{}={}}}", tag, escape_tag(value)));
                }
            }
        }
        if tags.is_empty() {
            return;
        }
        tags.push_str(&format!(
            "{{#software=mplc {}}}{{#}}",
            env!("CARGO_PKG_VERSION")
        ));
        self.seq
            .emit_meta(TRACK_META, MetaKind::Text, tags.into_bytes(), 0);
    }

    // ------------------------------------------------------------------
    // Variable and constant expansion
    // ------------------------------------------------------------------

    /// Replace `$name` references with constants, then variables.
    fn expand_refs(&self, text: &str, line: &Line) -> std::result::Result<String, ParseError> {
        self.expand(text, line, true)
    }

    /// Replace `$name` references with constants only; variable references
    /// are a context violation (INSTRUMENTS entries, pass-1 definitions).
    fn expand_consts(&self, text: &str, line: &Line) -> std::result::Result<String, ParseError> {
        self.expand(text, line, false)
    }

    fn expand(
        &self,
        text: &str,
        line: &Line,
        allow_vars: bool,
    ) -> std::result::Result<String, ParseError> {
        if !text.contains('$') {
            return Ok(text.to_string());
        }

        let mut result = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find('$') {
            result.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            let name_len = 1 + tail[1..]
                .bytes()
                .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
                .count();
            let name = &tail[..name_len];
            rest = &tail[name_len..];
            if name.len() == 1 {
                result.push('$');
                continue;
            }
            if let Some(value) = self.constants.get(name) {
                result.push_str(value);
            } else if let Some(value) = self.variables.get(name) {
                if !allow_vars {
                    return Err(line.error(
                        ErrorKind::ContextViolation,
                        format!("variable '{}' is not allowed here", name),
                    ));
                }
                result.push_str(value);
            } else {
                return Err(line.error(
                    ErrorKind::UnknownVar,
                    format!("unknown constant or variable '{}'", name),
                ));
            }
        }
        result.push_str(rest);
        Ok(result)
    }

    fn warn(&mut self, line: &Line, message: impl Into<String>) {
        self.warnings.push(Warning {
            file: line.file.as_ref().clone(),
            line: line.number,
            message: message.into(),
        });
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn file_error(path: &Path, line: usize, err: std::io::Error) -> Error {
    let kind = if err.kind() == std::io::ErrorKind::NotFound {
        ErrorKind::FileNotFound
    } else {
        ErrorKind::IncludeFailure
    };
    Error::Parse(ParseError::new(
        path.to_path_buf(),
        line,
        kind,
        err.to_string(),
    ))
}

/// Parse `$name = value`, returning the name with its `$` sigil.
fn split_assignment(text: &str) -> Option<(String, String)> {
    let text = text.trim();
    if !text.starts_with('$') {
        return None;
    }
    let (name, value) = match text.split_once('=') {
        Some((name, value)) => (name.trim(), value.trim()),
        None => {
            // Whitespace-separated form: $name value
            let (name, value) = split_first_token(text);
            (name, value)
        }
    };
    if name.len() < 2
        || !name[1..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

fn append_field(slot: &mut Option<String>, value: &str) {
    match slot {
        Some(existing) => {
            existing.push_str("\r\n");
            existing.push_str(value);
        }
        None => *slot = Some(value.to_string()),
    }
}

/// RP-026 tag escaping.
fn escape_tag(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '{' => escaped.push_str("\\{"),
            '}' => escaped.push_str("\\}"),
            '[' => escaped.push_str("\\["),
            ']' => escaped.push_str("\\]"),
            '\t' => escaped.push_str("\\t"),
            '\r' => escaped.push_str("\\r"),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Index of the `END` that closes the opener at `open_idx`. Pass 1 has
/// verified balance, so this always finds one.
fn skip_to_end(lines: &[Line], open_idx: usize, dict: &Dict) -> usize {
    let mut depth = 0usize;
    for (idx, line) in lines.iter().enumerate().skip(open_idx + 1) {
        match classify(line, dict) {
            LineKind::FunctionOpen
            | LineKind::Instruments
            | LineKind::Meta
            | LineKind::SoftKaraoke => depth += 1,
            LineKind::BlockOpen => depth += 1,
            LineKind::BlockClose => depth = depth.saturating_sub(1),
            LineKind::End => {
                if depth == 0 {
                    return idx;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    lines.len().saturating_sub(1)
}

/// Index of the `}` that closes the block opened at `open_idx`.
fn find_block_close(lines: &[Line], open_idx: usize, dict: &Dict) -> usize {
    let mut depth = 0usize;
    for (idx, line) in lines.iter().enumerate().skip(open_idx + 1) {
        match classify(line, dict) {
            LineKind::BlockOpen => depth += 1,
            LineKind::BlockClose => {
                if depth == 0 {
                    return idx;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    lines.len().saturating_sub(1)
}
