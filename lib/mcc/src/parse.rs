// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recursive-descent parser over the token stream file.
//!
//! Pass two of the pipeline: tokens are streamed back off disk (the string
//! table is loaded first, since names are needed throughout) and turned
//! into the arena tree of [`crate::ast`]. Expressions use precedence
//! climbing with the C table; assignment and the ternary are
//! right-associative, everything else is left-associative.
//!
//! Error discipline: a malformed construct records a diagnostic and the
//! parser re-synchronises at `;`, `}`, or end of file, then keeps going.
//! Ten diagnostics abort the pass. Constructs the backend refuses
//! (switch, goto, member access) are parsed fully and represented as
//! `Unsupported` nodes so the refusal happens in one place, with NOSYS.

use fs_api::{FileSys, Handle, OpenMode, Whence};

use crate::ast::{
    Ast, Base, BinOp, CType, Expr, ExprId, FuncDef, GlobalDef, GlobalInit,
    Param, Stmt, StmtId, UnOp, Unit,
};
use crate::strtab::StrTab;
use crate::token::{
    StreamHeader, Token, TokenKind, STREAM_HEADER_LEN, TOKEN_LEN,
};
use crate::{Diag, Error, MAX_DIAGS};

/// Tokens buffered ahead of the cursor.
const LOOKAHEAD: usize = 2;

/// Streams tokens back out of a stream file, with two tokens of lookahead.
/// The string table is pulled into memory at open; tokens are read in
/// small batches.
pub struct TokenStream<'f> {
    fs: &'f mut dyn FileSys,
    handle: Handle,
    remaining: u32,
    pending: [Option<Token>; LOOKAHEAD],
    strtab: StrTab,
    last_line: u16,
}

impl<'f> TokenStream<'f> {
    pub fn open(fs: &'f mut dyn FileSys, path: &str) -> Result<Self, Error> {
        let handle = fs.open(path, OpenMode::READ)?;
        let mut ts = Self {
            fs,
            handle,
            remaining: 0,
            pending: [None; LOOKAHEAD],
            strtab: StrTab::new(),
            last_line: 1,
        };
        match ts.read_prelude(path) {
            Ok(()) => Ok(ts),
            Err(e) => Err(e), // Drop closes the handle.
        }
    }

    fn read_prelude(&mut self, path: &str) -> Result<(), Error> {
        let mut hb = [0u8; STREAM_HEADER_LEN];
        self.fs
            .read_exact(self.handle, &mut hb)
            .map_err(|_| Error::Corrupt("short token stream header"))?;
        let header = StreamHeader::from_bytes(&hb)
            .ok_or(Error::Corrupt("bad token stream header"))?;
        log::debug!(
            "token stream {}: {} tokens, {}B strings",
            path,
            header.token_count,
            header.strtab_len
        );

        // The string table trails the tokens; fetch it first, then rewind.
        let strtab_off = STREAM_HEADER_LEN as u32
            + header.token_count * TOKEN_LEN as u32;
        self.fs
            .seek(self.handle, strtab_off as i32, Whence::Set)?;
        let mut table = vec![0u8; header.strtab_len as usize];
        self.fs
            .read_exact(self.handle, &mut table)
            .map_err(|_| Error::Corrupt("truncated string table"))?;
        self.strtab = StrTab::from_bytes(table);
        self.fs
            .seek(self.handle, STREAM_HEADER_LEN as i32, Whence::Set)?;
        self.remaining = header.token_count;
        Ok(())
    }

    pub fn strtab(&self) -> &StrTab {
        &self.strtab
    }

    fn fetch(&mut self) -> Result<Token, Error> {
        if self.remaining == 0 {
            return Ok(Token::eof(self.last_line));
        }
        let mut b = [0u8; TOKEN_LEN];
        self.fs
            .read_exact(self.handle, &mut b)
            .map_err(|_| Error::Corrupt("truncated token stream"))?;
        self.remaining -= 1;
        let t = Token::from_bytes(&b)
            .ok_or(Error::Corrupt("bad token record"))?;
        self.last_line = t.line;
        Ok(t)
    }

    pub fn peek(&mut self) -> Result<Token, Error> {
        if self.pending[0].is_none() {
            self.pending[0] = Some(self.fetch()?);
        }
        Ok(self.pending[0].unwrap())
    }

    pub fn peek2(&mut self) -> Result<Token, Error> {
        self.peek()?;
        if self.pending[1].is_none() {
            self.pending[1] = Some(self.fetch()?);
        }
        Ok(self.pending[1].unwrap())
    }

    pub fn next(&mut self) -> Result<Token, Error> {
        let t = self.peek()?;
        self.pending[0] = self.pending[1].take();
        Ok(t)
    }

    /// Surrenders the string table; the stream is done.
    fn into_strtab(mut self) -> StrTab {
        core::mem::take(&mut self.strtab)
    }
}

impl Drop for TokenStream<'_> {
    fn drop(&mut self) {
        let _ = self.fs.close(self.handle);
    }
}

/// Parses the token stream file at `path` into a translation unit plus the
/// string table its names live in.
pub fn parse_stream(
    fs: &mut dyn FileSys,
    path: &str,
) -> Result<(Unit, StrTab), Error> {
    let ts = TokenStream::open(fs, path)?;
    let mut p = Parser {
        ts,
        ast: Ast::new(),
        funcs: Vec::new(),
        globals: Vec::new(),
        protos: Vec::new(),
        typedefs: fnv::FnvHashMap::default(),
        enums: fnv::FnvHashMap::default(),
        diags: Vec::new(),
    };
    let run = p.unit();
    let diags = core::mem::take(&mut p.diags);
    let Parser {
        ts,
        ast,
        funcs,
        globals,
        protos,
        ..
    } = p;
    let strtab = ts.into_strtab();
    run?;
    if !diags.is_empty() {
        return Err(Error::Syntax(diags));
    }
    Ok((
        Unit {
            ast,
            funcs,
            globals,
            protos,
        },
        strtab,
    ))
}

struct Parser<'f> {
    ts: TokenStream<'f>,
    ast: Ast,
    funcs: Vec<FuncDef>,
    globals: Vec<GlobalDef>,
    protos: Vec<u32>,
    typedefs: fnv::FnvHashMap<String, CType>,
    enums: fnv::FnvHashMap<String, u32>,
    diags: Vec<Diag>,
}

/// Storage-class bits picked up while parsing declaration specifiers.
#[derive(Default, Copy, Clone)]
struct Storage {
    is_static: bool,
    is_extern: bool,
    is_typedef: bool,
}

impl Parser<'_> {
    fn error(&mut self, line: u16, message: String) -> Result<(), Error> {
        if self.diags.len() < MAX_DIAGS {
            self.diags.push(Diag {
                line,
                col: 0,
                message,
            });
        }
        if self.diags.len() >= MAX_DIAGS {
            return Err(Error::Syntax(core::mem::take(&mut self.diags)));
        }
        Ok(())
    }

    fn name(&mut self, t: Token) -> String {
        self.ts.strtab().get(t.value).to_string()
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, Error> {
        let t = self.ts.peek()?;
        if t.kind == kind {
            return self.ts.next();
        }
        self.error(t.line, format!("expected {what}"))?;
        Ok(t)
    }

    fn eat(&mut self, kind: TokenKind) -> Result<bool, Error> {
        if self.ts.peek()?.kind == kind {
            self.ts.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Skips forward to a `;` or `}` (consuming it) or EOF.
    fn synchronize(&mut self) -> Result<(), Error> {
        loop {
            let t = self.ts.peek()?;
            match t.kind {
                TokenKind::Eof => return Ok(()),
                TokenKind::Semi | TokenKind::RBrace => {
                    self.ts.next()?;
                    return Ok(());
                }
                _ => {
                    self.ts.next()?;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Types and declarations

    /// True when the upcoming token opens a declaration.
    fn at_type(&mut self) -> Result<bool, Error> {
        let t = self.ts.peek()?;
        Ok(match t.kind {
            TokenKind::KwVoid
            | TokenKind::KwChar
            | TokenKind::KwShort
            | TokenKind::KwInt
            | TokenKind::KwLong
            | TokenKind::KwSigned
            | TokenKind::KwUnsigned
            | TokenKind::KwFloat
            | TokenKind::KwDouble
            | TokenKind::KwConst
            | TokenKind::KwVolatile
            | TokenKind::KwStatic
            | TokenKind::KwExtern
            | TokenKind::KwTypedef
            | TokenKind::KwRegister
            | TokenKind::KwAuto
            | TokenKind::KwStruct
            | TokenKind::KwUnion
            | TokenKind::KwEnum => true,
            TokenKind::Ident => {
                let n = self.name(t);
                self.typedefs.contains_key(&n)
            }
            _ => false,
        })
    }

    /// Parses declaration specifiers into a base type plus storage flags.
    fn specifiers(&mut self) -> Result<(CType, Storage), Error> {
        let mut storage = Storage::default();
        let mut base: Option<Base> = None;
        let mut saw_int_words = false;
        let mut ty_override: Option<CType> = None;
        loop {
            let t = self.ts.peek()?;
            match t.kind {
                TokenKind::KwStatic => storage.is_static = true,
                TokenKind::KwExtern => storage.is_extern = true,
                TokenKind::KwTypedef => storage.is_typedef = true,
                TokenKind::KwConst
                | TokenKind::KwVolatile
                | TokenKind::KwRegister
                | TokenKind::KwAuto => {}
                TokenKind::KwVoid => base = Some(Base::Void),
                TokenKind::KwChar => base = Some(Base::Char),
                TokenKind::KwFloat | TokenKind::KwDouble => {
                    base = Some(Base::Float)
                }
                TokenKind::KwInt
                | TokenKind::KwShort
                | TokenKind::KwLong
                | TokenKind::KwSigned
                | TokenKind::KwUnsigned => saw_int_words = true,
                TokenKind::KwStruct | TokenKind::KwUnion => {
                    self.ts.next()?;
                    self.record_type(t.line)?;
                    base = Some(Base::Int);
                    continue;
                }
                TokenKind::KwEnum => {
                    self.ts.next()?;
                    self.enum_type(t.line)?;
                    base = Some(Base::Int);
                    continue;
                }
                TokenKind::Ident
                    if base.is_none()
                        && !saw_int_words
                        && ty_override.is_none() =>
                {
                    let n = self.name(t);
                    if let Some(&ty) = self.typedefs.get(&n) {
                        ty_override = Some(ty);
                        self.ts.next()?;
                        continue;
                    }
                    break;
                }
                _ => break,
            }
            self.ts.next()?;
        }
        if let Some(ty) = ty_override {
            return Ok((ty, storage));
        }
        let base = base.unwrap_or(Base::Int);
        let _ = saw_int_words;
        Ok((
            CType {
                base,
                ptr: 0,
                array: None,
            },
            storage,
        ))
    }

    /// Parses a struct/union tag and optional member list; the members are
    /// consumed and discarded (declaring variables of the type is what the
    /// backend rejects).
    fn record_type(&mut self, line: u16) -> Result<(), Error> {
        if self.ts.peek()?.kind == TokenKind::Ident {
            self.ts.next()?;
        }
        if self.eat(TokenKind::LBrace)? {
            let mut depth = 1;
            loop {
                let t = self.ts.next()?;
                match t.kind {
                    TokenKind::LBrace => depth += 1,
                    TokenKind::RBrace => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    TokenKind::Eof => {
                        return self
                            .error(line, "unterminated struct body".into());
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Parses an enum declaration, folding its constants into the
    /// enumerator namespace.
    fn enum_type(&mut self, line: u16) -> Result<(), Error> {
        if self.ts.peek()?.kind == TokenKind::Ident {
            self.ts.next()?;
        }
        if !self.eat(TokenKind::LBrace)? {
            return Ok(());
        }
        let mut next = 0u32;
        loop {
            let t = self.ts.peek()?;
            match t.kind {
                TokenKind::RBrace => {
                    self.ts.next()?;
                    break;
                }
                TokenKind::Ident => {
                    self.ts.next()?;
                    let name = self.name(t);
                    if self.eat(TokenKind::Assign)? {
                        let e = self.assign_expr()?;
                        match self.fold(e) {
                            Some(v) => next = v,
                            None => self.error(
                                t.line,
                                format!("enumerator {name} is not constant"),
                            )?,
                        }
                    }
                    self.enums.insert(name, next);
                    next = next.wrapping_add(1);
                    if !self.eat(TokenKind::Comma)? {
                        self.expect(TokenKind::RBrace, "} after enum")?;
                        break;
                    }
                }
                _ => {
                    self.error(line, "malformed enum body".into())?;
                    self.synchronize()?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Parses `* ... name` plus one optional array or parameter-list
    /// suffix. Returns the name token and the completed type, and the
    /// parameter list when this declarator is a function.
    fn declarator(
        &mut self,
        mut ty: CType,
    ) -> Result<(Token, CType, Option<Vec<Param>>), Error> {
        while self.eat(TokenKind::Star)? {
            ty = ty.ptr_to();
        }
        let name = self.expect(TokenKind::Ident, "declarator name")?;
        if self.eat(TokenKind::LBracket)? {
            let t = self.ts.peek()?;
            if t.kind == TokenKind::RBracket {
                self.error(t.line, "array bound required".into())?;
                ty.array = Some(1);
            } else {
                let e = self.assign_expr()?;
                let bound = self.fold(e).filter(|&n| n > 0);
                if bound.is_none() {
                    self.error(
                        t.line,
                        "array bound must be constant".into(),
                    )?;
                }
                ty.array = Some(bound.unwrap_or(1));
            }
            self.expect(TokenKind::RBracket, "] after array bound")?;
            return Ok((name, ty, None));
        }
        if self.eat(TokenKind::LParen)? {
            let params = self.param_list()?;
            return Ok((name, ty, Some(params)));
        }
        Ok((name, ty, None))
    }

    fn param_list(&mut self) -> Result<Vec<Param>, Error> {
        let mut params = Vec::new();
        if self.eat(TokenKind::RParen)? {
            return Ok(params);
        }
        // `(void)` is an empty list.
        if self.ts.peek()?.kind == TokenKind::KwVoid
            && self.ts.peek2()?.kind == TokenKind::RParen
        {
            self.ts.next()?;
            self.ts.next()?;
            return Ok(params);
        }
        loop {
            if self.eat(TokenKind::Ellipsis)? {
                // Variadic markers parse; calls still pass at most four
                // words.
                break;
            }
            let (base, _) = self.specifiers()?;
            let mut ty = base;
            while self.eat(TokenKind::Star)? {
                ty = ty.ptr_to();
            }
            let mut name = 0;
            let t = self.ts.peek()?;
            if t.kind == TokenKind::Ident {
                self.ts.next()?;
                name = t.value;
            }
            if self.eat(TokenKind::LBracket)? {
                // Array parameters decay to pointers.
                if self.ts.peek()?.kind != TokenKind::RBracket {
                    let e = self.assign_expr()?;
                    let _ = self.fold(e);
                }
                self.expect(TokenKind::RBracket, "]")?;
                ty = ty.ptr_to();
            }
            params.push(Param { name, ty });
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RParen, ") after parameters")?;
        Ok(params)
    }

    fn unit(&mut self) -> Result<(), Error> {
        loop {
            let t = self.ts.peek()?;
            if t.kind == TokenKind::Eof {
                return Ok(());
            }
            if self.eat(TokenKind::Semi)? {
                continue;
            }
            if !self.at_type()? {
                self.error(
                    t.line,
                    "expected declaration at top level".into(),
                )?;
                self.synchronize()?;
                continue;
            }
            self.top_declaration()?;
        }
    }

    fn top_declaration(&mut self) -> Result<(), Error> {
        let (base, storage) = self.specifiers()?;
        // Bare `struct S;` / `enum E { .. };` declarations.
        if self.eat(TokenKind::Semi)? {
            return Ok(());
        }
        loop {
            let (name_tok, ty, params) = self.declarator(base)?;
            if name_tok.kind != TokenKind::Ident {
                self.synchronize()?;
                return Ok(());
            }
            if storage.is_typedef {
                let n = self.name(name_tok);
                self.typedefs.insert(n, ty);
            } else if let Some(params) = params {
                // Function: body or prototype.
                if self.ts.peek()?.kind == TokenKind::LBrace {
                    let body = self.compound()?;
                    self.funcs.push(FuncDef {
                        name: name_tok.value,
                        params,
                        ret: ty,
                        body,
                        is_static: storage.is_static,
                        line: name_tok.line,
                    });
                    return Ok(());
                }
                self.protos.push(name_tok.value);
            } else {
                let init = if self.eat(TokenKind::Assign)? {
                    self.global_init(name_tok.line)?
                } else {
                    None
                };
                if !storage.is_extern {
                    self.globals.push(GlobalDef {
                        name: name_tok.value,
                        ty,
                        init,
                        is_static: storage.is_static,
                        line: name_tok.line,
                    });
                }
            }
            if self.eat(TokenKind::Comma)? {
                continue;
            }
            self.expect(TokenKind::Semi, "; after declaration")?;
            return Ok(());
        }
    }

    fn global_init(&mut self, line: u16) -> Result<Option<GlobalInit>, Error> {
        let t = self.ts.peek()?;
        if t.kind == TokenKind::LBrace {
            self.error(
                line,
                "aggregate initialisers are not supported".into(),
            )?;
            self.synchronize()?;
            return Ok(None);
        }
        if t.kind == TokenKind::Str {
            self.ts.next()?;
            return Ok(Some(GlobalInit::Str(t.value)));
        }
        let e = self.assign_expr()?;
        match self.fold(e) {
            Some(v) => Ok(Some(GlobalInit::Const(v))),
            None => {
                self.error(
                    line,
                    "global initialiser must be constant".into(),
                )?;
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements

    fn compound(&mut self) -> Result<StmtId, Error> {
        let open = self.expect(TokenKind::LBrace, "{")?;
        let mut body = Vec::new();
        loop {
            let t = self.ts.peek()?;
            match t.kind {
                TokenKind::RBrace => {
                    self.ts.next()?;
                    break;
                }
                TokenKind::Eof => {
                    self.error(open.line, "unterminated block".into())?;
                    break;
                }
                _ => body.push(self.statement()?),
            }
        }
        Ok(self.ast.stmt(Stmt::Compound(body), open.line))
    }

    fn statement(&mut self) -> Result<StmtId, Error> {
        let t = self.ts.peek()?;
        match t.kind {
            TokenKind::LBrace => self.compound(),
            TokenKind::Semi => {
                self.ts.next()?;
                Ok(self.ast.stmt(Stmt::Empty, t.line))
            }
            TokenKind::KwIf => {
                self.ts.next()?;
                self.expect(TokenKind::LParen, "( after if")?;
                let cond = self.expression()?;
                self.expect(TokenKind::RParen, ") after condition")?;
                let then_ = self.statement()?;
                let else_ = if self.eat(TokenKind::KwElse)? {
                    Some(self.statement()?)
                } else {
                    None
                };
                Ok(self.ast.stmt(
                    Stmt::If {
                        cond,
                        then_,
                        else_,
                    },
                    t.line,
                ))
            }
            TokenKind::KwWhile => {
                self.ts.next()?;
                self.expect(TokenKind::LParen, "( after while")?;
                let cond = self.expression()?;
                self.expect(TokenKind::RParen, ") after condition")?;
                let body = self.statement()?;
                Ok(self.ast.stmt(Stmt::While { cond, body }, t.line))
            }
            TokenKind::KwDo => {
                self.ts.next()?;
                let body = self.statement()?;
                self.expect(TokenKind::KwWhile, "while after do body")?;
                self.expect(TokenKind::LParen, "(")?;
                let cond = self.expression()?;
                self.expect(TokenKind::RParen, ")")?;
                self.expect(TokenKind::Semi, "; after do/while")?;
                Ok(self.ast.stmt(Stmt::DoWhile { body, cond }, t.line))
            }
            TokenKind::KwFor => {
                self.ts.next()?;
                self.expect(TokenKind::LParen, "( after for")?;
                let init = if self.eat(TokenKind::Semi)? {
                    None
                } else if self.at_type()? {
                    Some(self.declaration_stmt()?)
                } else {
                    let e = self.expression()?;
                    self.expect(TokenKind::Semi, "; in for header")?;
                    Some(self.ast.stmt(Stmt::Expr(e), t.line))
                };
                let cond = if self.ts.peek()?.kind == TokenKind::Semi {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(TokenKind::Semi, "; in for header")?;
                let step = if self.ts.peek()?.kind == TokenKind::RParen {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(TokenKind::RParen, ") after for header")?;
                let body = self.statement()?;
                Ok(self.ast.stmt(
                    Stmt::For {
                        init,
                        cond,
                        step,
                        body,
                    },
                    t.line,
                ))
            }
            TokenKind::KwReturn => {
                self.ts.next()?;
                let value = if self.ts.peek()?.kind == TokenKind::Semi {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(TokenKind::Semi, "; after return")?;
                Ok(self.ast.stmt(Stmt::Return(value), t.line))
            }
            TokenKind::KwBreak => {
                self.ts.next()?;
                self.expect(TokenKind::Semi, "; after break")?;
                Ok(self.ast.stmt(Stmt::Break, t.line))
            }
            TokenKind::KwContinue => {
                self.ts.next()?;
                self.expect(TokenKind::Semi, "; after continue")?;
                Ok(self.ast.stmt(Stmt::Continue, t.line))
            }
            TokenKind::KwSwitch => {
                self.ts.next()?;
                self.expect(TokenKind::LParen, "(")?;
                let _ = self.expression()?;
                self.expect(TokenKind::RParen, ")")?;
                let _ = self.statement()?;
                Ok(self.ast.stmt(Stmt::Unsupported("switch"), t.line))
            }
            TokenKind::KwCase | TokenKind::KwDefault => {
                self.ts.next()?;
                if t.kind == TokenKind::KwCase {
                    let _ = self.expression()?;
                }
                self.expect(TokenKind::Colon, ": after case label")?;
                let _ = self.statement()?;
                Ok(self.ast.stmt(Stmt::Unsupported("case"), t.line))
            }
            TokenKind::KwGoto => {
                self.ts.next()?;
                self.expect(TokenKind::Ident, "label after goto")?;
                self.expect(TokenKind::Semi, "; after goto")?;
                Ok(self.ast.stmt(Stmt::Unsupported("goto"), t.line))
            }
            _ => {
                if t.kind == TokenKind::Ident
                    && self.ts.peek2()?.kind == TokenKind::Colon
                {
                    // A statement label. Parsed, rejected downstream.
                    self.ts.next()?;
                    self.ts.next()?;
                    let _ = self.statement()?;
                    return Ok(
                        self.ast.stmt(Stmt::Unsupported("label"), t.line)
                    );
                }
                if self.at_type()? {
                    return self.declaration_stmt();
                }
                let e = self.expression()?;
                self.expect(TokenKind::Semi, "; after expression")?;
                Ok(self.ast.stmt(Stmt::Expr(e), t.line))
            }
        }
    }

    /// Block-scope declaration: one or more declarators, optional scalar
    /// initialisers, trailing `;`. Produces a compound when a line
    /// declares several names.
    fn declaration_stmt(&mut self) -> Result<StmtId, Error> {
        let (base, storage) = self.specifiers()?;
        let line = self.ts.peek()?.line;
        if storage.is_typedef {
            // Block-scope typedef: accepted, same namespace as file scope.
            let (name_tok, ty, _) = self.declarator(base)?;
            let n = self.name(name_tok);
            self.typedefs.insert(n, ty);
            self.expect(TokenKind::Semi, "; after typedef")?;
            return Ok(self.ast.stmt(Stmt::Empty, line));
        }
        let mut decls = Vec::new();
        loop {
            let (name_tok, ty, params) = self.declarator(base)?;
            if params.is_some() {
                // A nested prototype; legal C, nothing for us to emit.
                self.protos.push(name_tok.value);
                break;
            }
            let init = if self.eat(TokenKind::Assign)? {
                if self.ts.peek()?.kind == TokenKind::LBrace {
                    self.error(
                        name_tok.line,
                        "aggregate initialisers are not supported".into(),
                    )?;
                    self.synchronize()?;
                    return Ok(self.ast.stmt(Stmt::Empty, line));
                }
                Some(self.assign_expr()?)
            } else {
                None
            };
            decls.push(self.ast.stmt(
                Stmt::Decl {
                    name: name_tok.value,
                    ty,
                    init,
                },
                name_tok.line,
            ));
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::Semi, "; after declaration")?;
        Ok(match decls.len() {
            1 => decls[0],
            _ => self.ast.stmt(Stmt::Compound(decls), line),
        })
    }

    // ------------------------------------------------------------------
    // Expressions

    fn expression(&mut self) -> Result<ExprId, Error> {
        let mut lhs = self.assign_expr()?;
        while self.ts.peek()?.kind == TokenKind::Comma {
            let t = self.ts.next()?;
            let rhs = self.assign_expr()?;
            lhs = self.ast.expr(Expr::Comma { lhs, rhs }, t.line);
        }
        Ok(lhs)
    }

    fn assign_expr(&mut self) -> Result<ExprId, Error> {
        let lhs = self.ternary()?;
        let t = self.ts.peek()?;
        let op = match t.kind {
            TokenKind::Assign => None,
            TokenKind::PlusEq => Some(BinOp::Add),
            TokenKind::MinusEq => Some(BinOp::Sub),
            TokenKind::StarEq => Some(BinOp::Mul),
            TokenKind::SlashEq => Some(BinOp::Div),
            TokenKind::PercentEq => Some(BinOp::Mod),
            TokenKind::AmpEq => Some(BinOp::And),
            TokenKind::PipeEq => Some(BinOp::Or),
            TokenKind::CaretEq => Some(BinOp::Xor),
            TokenKind::ShlEq => Some(BinOp::Shl),
            TokenKind::ShrEq => Some(BinOp::Shr),
            _ => return Ok(lhs),
        };
        self.ts.next()?;
        // Right-associative: recurse at the same level.
        let rhs = self.assign_expr()?;
        Ok(self.ast.expr(Expr::Assign { op, lhs, rhs }, t.line))
    }

    fn ternary(&mut self) -> Result<ExprId, Error> {
        let cond = self.binary(0)?;
        if self.ts.peek()?.kind != TokenKind::Question {
            return Ok(cond);
        }
        let t = self.ts.next()?;
        let then_ = self.expression()?;
        self.expect(TokenKind::Colon, ": in conditional")?;
        let else_ = self.ternary()?;
        Ok(self.ast.expr(
            Expr::Ternary {
                cond,
                then_,
                else_,
            },
            t.line,
        ))
    }

    fn bin_op(kind: TokenKind) -> Option<(BinOp, u8)> {
        use TokenKind::*;
        Some(match kind {
            OrOr => (BinOp::LogOr, 1),
            AndAnd => (BinOp::LogAnd, 2),
            Pipe => (BinOp::Or, 3),
            Caret => (BinOp::Xor, 4),
            Amp => (BinOp::And, 5),
            EqEq => (BinOp::Eq, 6),
            Ne => (BinOp::Ne, 6),
            Lt => (BinOp::Lt, 7),
            Le => (BinOp::Le, 7),
            Gt => (BinOp::Gt, 7),
            Ge => (BinOp::Ge, 7),
            Shl => (BinOp::Shl, 8),
            Shr => (BinOp::Shr, 8),
            Plus => (BinOp::Add, 9),
            Minus => (BinOp::Sub, 9),
            Star => (BinOp::Mul, 10),
            Slash => (BinOp::Div, 10),
            Percent => (BinOp::Mod, 10),
            _ => return None,
        })
    }

    /// Precedence climbing: parses operators with precedence > `min`.
    /// All binary operators here are left-associative.
    fn binary(&mut self, min: u8) -> Result<ExprId, Error> {
        let mut lhs = self.unary()?;
        loop {
            let t = self.ts.peek()?;
            let Some((op, prec)) = Self::bin_op(t.kind) else {
                return Ok(lhs);
            };
            if prec <= min {
                return Ok(lhs);
            }
            self.ts.next()?;
            let rhs = self.binary(prec)?;
            lhs = self.ast.expr(Expr::Binary { op, lhs, rhs }, t.line);
        }
    }

    fn unary(&mut self) -> Result<ExprId, Error> {
        let t = self.ts.peek()?;
        let op = match t.kind {
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Bang => Some(UnOp::Not),
            TokenKind::Tilde => Some(UnOp::BitNot),
            TokenKind::Star => Some(UnOp::Deref),
            TokenKind::Amp => Some(UnOp::Addr),
            TokenKind::PlusPlus => Some(UnOp::PreInc),
            TokenKind::MinusMinus => Some(UnOp::PreDec),
            TokenKind::Plus => {
                // Unary plus is a no-op.
                self.ts.next()?;
                return self.unary();
            }
            TokenKind::KwSizeof => {
                self.ts.next()?;
                return self.sizeof_expr(t.line);
            }
            TokenKind::LParen => {
                // A parenthesised type here is a cast.
                let ahead = self.ts.peek2()?;
                if self.starts_type(ahead)? {
                    self.ts.next()?;
                    let (base, _) = self.specifiers()?;
                    let mut ty = base;
                    while self.eat(TokenKind::Star)? {
                        ty = ty.ptr_to();
                    }
                    let _ = ty; // casts don't change representation
                    self.expect(TokenKind::RParen, ") after cast")?;
                    return self.unary();
                }
                None
            }
            _ => None,
        };
        if let Some(op) = op {
            self.ts.next()?;
            let rhs = self.unary()?;
            return Ok(self.ast.expr(Expr::Unary { op, rhs }, t.line));
        }
        self.postfix()
    }

    /// Type-start test for an already-fetched token (cast lookahead).
    fn starts_type(&mut self, t: Token) -> Result<bool, Error> {
        Ok(match t.kind {
            TokenKind::KwVoid
            | TokenKind::KwChar
            | TokenKind::KwShort
            | TokenKind::KwInt
            | TokenKind::KwLong
            | TokenKind::KwSigned
            | TokenKind::KwUnsigned
            | TokenKind::KwFloat
            | TokenKind::KwDouble
            | TokenKind::KwConst
            | TokenKind::KwStruct
            | TokenKind::KwUnion
            | TokenKind::KwEnum => true,
            TokenKind::Ident => {
                let n = self.name(t);
                self.typedefs.contains_key(&n)
            }
            _ => false,
        })
    }

    fn sizeof_expr(&mut self, line: u16) -> Result<ExprId, Error> {
        if self.ts.peek()?.kind == TokenKind::LParen {
            let ahead = self.ts.peek2()?;
            if self.starts_type(ahead)? {
                self.ts.next()?;
                let (base, _) = self.specifiers()?;
                let mut ty = base;
                while self.eat(TokenKind::Star)? {
                    ty = ty.ptr_to();
                }
                if self.eat(TokenKind::LBracket)? {
                    let e = self.assign_expr()?;
                    ty.array = self.fold(e);
                    self.expect(TokenKind::RBracket, "]")?;
                }
                self.expect(TokenKind::RParen, ") after sizeof")?;
                return Ok(self.ast.expr(Expr::Sizeof(ty.size()), line));
            }
        }
        // sizeof expr: everything the backend computes in registers is a
        // word.
        let _ = self.unary()?;
        Ok(self.ast.expr(Expr::Sizeof(4), line))
    }

    fn postfix(&mut self) -> Result<ExprId, Error> {
        let mut e = self.primary()?;
        loop {
            let t = self.ts.peek()?;
            match t.kind {
                TokenKind::LBracket => {
                    self.ts.next()?;
                    let index = self.expression()?;
                    self.expect(TokenKind::RBracket, "] after index")?;
                    e = self.ast.expr(Expr::Index { base: e, index }, t.line);
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    self.ts.next()?;
                    e = self.ast.expr(
                        Expr::Postfix {
                            dec: t.kind == TokenKind::MinusMinus,
                            lhs: e,
                        },
                        t.line,
                    );
                }
                TokenKind::Dot | TokenKind::Arrow => {
                    self.ts.next()?;
                    self.expect(TokenKind::Ident, "member name")?;
                    e = self.ast.expr(
                        Expr::Unsupported("member access"),
                        t.line,
                    );
                }
                _ => return Ok(e),
            }
        }
    }

    fn primary(&mut self) -> Result<ExprId, Error> {
        let t = self.ts.next()?;
        match t.kind {
            TokenKind::Num | TokenKind::CharLit => {
                Ok(self.ast.expr(Expr::Num(t.value), t.line))
            }
            TokenKind::Str => Ok(self.ast.expr(Expr::Str(t.value), t.line)),
            TokenKind::Ident => {
                // Call?
                if self.ts.peek()?.kind == TokenKind::LParen {
                    self.ts.next()?;
                    let mut args = Vec::new();
                    if self.ts.peek()?.kind != TokenKind::RParen {
                        loop {
                            args.push(self.assign_expr()?);
                            if !self.eat(TokenKind::Comma)? {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, ") after arguments")?;
                    return Ok(self.ast.expr(
                        Expr::Call {
                            name: t.value,
                            args,
                        },
                        t.line,
                    ));
                }
                let n = self.name(t);
                if let Some(&v) = self.enums.get(&n) {
                    return Ok(self.ast.expr(Expr::Num(v), t.line));
                }
                Ok(self.ast.expr(Expr::Ident(t.value), t.line))
            }
            TokenKind::LParen => {
                let e = self.expression()?;
                self.expect(TokenKind::RParen, ") after expression")?;
                Ok(e)
            }
            _ => {
                self.error(t.line, "expected expression".into())?;
                Ok(self.ast.expr(Expr::Num(0), t.line))
            }
        }
    }

    /// Constant folding over an already-built subtree; used for enum
    /// values, array bounds, and global initialisers.
    fn fold(&self, id: ExprId) -> Option<u32> {
        match &self.ast.e(id).kind {
            Expr::Num(v) => Some(*v),
            Expr::Sizeof(v) => Some(*v),
            Expr::Unary { op, rhs } => {
                let v = self.fold(*rhs)?;
                match op {
                    UnOp::Neg => Some(v.wrapping_neg()),
                    UnOp::BitNot => Some(!v),
                    UnOp::Not => Some(u32::from(v == 0)),
                    _ => None,
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let a = self.fold(*lhs)?;
                let b = self.fold(*rhs)?;
                Some(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => {
                        return (b != 0)
                            .then(|| (a as i32).wrapping_div(b as i32) as u32)
                    }
                    BinOp::Mod => {
                        return (b != 0)
                            .then(|| (a as i32).wrapping_rem(b as i32) as u32)
                    }
                    BinOp::Shl => a.wrapping_shl(b),
                    BinOp::Shr => a.wrapping_shr(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Eq => u32::from(a == b),
                    BinOp::Ne => u32::from(a != b),
                    BinOp::Lt => u32::from((a as i32) < (b as i32)),
                    BinOp::Le => u32::from(a as i32 <= b as i32),
                    BinOp::Gt => u32::from(a as i32 > b as i32),
                    BinOp::Ge => u32::from(a as i32 >= b as i32),
                    BinOp::LogAnd => u32::from(a != 0 && b != 0),
                    BinOp::LogOr => u32::from(a != 0 || b != 0),
                })
            }
            _ => None,
        }
    }
}
