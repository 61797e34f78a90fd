// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The lexer: source bytes in, token stream file out.
//!
//! This is pass one of the disk-buffered pipeline. Tokens are written to a
//! temporary stream file as they are produced and the string table is
//! appended at the end, so the pass holds one small read buffer per open
//! source file and nothing else. Quoted `#include`s push the included file
//! onto a bounded stack and lex it inline; no other preprocessor directive
//! has a semantic effect.
//!
//! Errors do not stop the pass: each is recorded with its line and column
//! and lexing continues, up to [`crate::MAX_DIAGS`]; the driver fails the
//! compile afterward if any were recorded.

use fs_api::{FileSys, FsError, Handle, OpenMode, Whence};
use log::debug;

use crate::strtab::StrTab;
use crate::token::{
    keyword, punct1, StreamHeader, Token, TokenKind, FLAG_STRTAB,
    STREAM_HEADER_LEN,
};
use crate::{Diag, Error, MAX_DIAGS};

/// Maximum depth of nested quoted includes.
const INCLUDE_DEPTH: usize = 8;

/// Per-file read buffer size.
const READ_BUF: usize = 128;

/// What the pass reports on success.
#[derive(Copy, Clone, Debug)]
pub struct LexStats {
    pub tokens: u32,
    pub strtab_len: u32,
}

/// One open source file with a small read buffer and pushback.
struct Source {
    handle: Handle,
    buf: [u8; READ_BUF],
    start: usize,
    end: usize,
    pushback: Vec<u8>,
    line: u16,
    col: u16,
    /// True until a token is seen on the current line; directives are only
    /// recognised here.
    bol: bool,
}

impl Source {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            buf: [0; READ_BUF],
            start: 0,
            end: 0,
            pushback: Vec::new(),
            line: 1,
            col: 0,
            bol: true,
        }
    }

    fn fill(&mut self, fs: &mut dyn FileSys) -> Result<(), FsError> {
        if self.start == self.end {
            self.start = 0;
            self.end = fs.read(self.handle, &mut self.buf)?;
        }
        Ok(())
    }

    fn next(&mut self, fs: &mut dyn FileSys) -> Result<Option<u8>, FsError> {
        let b = if let Some(b) = self.pushback.pop() {
            Some(b)
        } else {
            self.fill(fs)?;
            if self.start == self.end {
                None
            } else {
                let b = self.buf[self.start];
                self.start += 1;
                Some(b)
            }
        };
        if let Some(b) = b {
            if b == b'\n' {
                self.line = self.line.saturating_add(1);
                self.col = 0;
                self.bol = true;
            } else {
                self.col = self.col.saturating_add(1);
            }
        }
        Ok(b)
    }

    fn peek(&mut self, fs: &mut dyn FileSys) -> Result<Option<u8>, FsError> {
        if let Some(&b) = self.pushback.last() {
            return Ok(Some(b));
        }
        self.fill(fs)?;
        if self.start == self.end {
            Ok(None)
        } else {
            Ok(Some(self.buf[self.start]))
        }
    }

    /// Pushes one byte back; position bookkeeping is deliberately not
    /// rewound, so only use this within a single line.
    fn unread(&mut self, b: u8) {
        self.pushback.push(b);
    }
}

struct Lexer<'f> {
    fs: &'f mut dyn FileSys,
    stack: Vec<Source>,
    out: Handle,
    strtab: StrTab,
    count: u32,
    diags: Vec<Diag>,
}

pub fn lex_to_stream(
    fs: &mut dyn FileSys,
    src_path: &str,
    out_path: &str,
) -> Result<LexStats, Error> {
    let src = fs.open(src_path, OpenMode::READ).map_err(Error::from)?;
    let out = match fs.open(
        out_path,
        OpenMode::WRITE | OpenMode::CREATE | OpenMode::TRUNC,
    ) {
        Ok(h) => h,
        Err(e) => {
            let _ = fs.close(src);
            return Err(e.into());
        }
    };

    let mut lx = Lexer {
        fs,
        stack: vec![Source::new(src)],
        out,
        strtab: StrTab::new(),
        count: 0,
        diags: Vec::new(),
    };

    // Header placeholder; rewritten with real counts at the end.
    let run = lx
        .write_out(&StreamHeader {
            token_count: 0,
            strtab_len: 0,
        }
        .to_bytes())
        .and_then(|()| lx.run());

    let stats = lx.finish(run)?;
    debug!(
        "lexed {}: {} tokens, {} strtab bytes",
        src_path, stats.tokens, stats.strtab_len
    );
    Ok(stats)
}

impl Lexer<'_> {
    fn run(&mut self) -> Result<(), Error> {
        loop {
            let Some((b, line, col)) = self.skip_trivia()? else {
                // Current file exhausted.
                if self.stack.len() > 1 {
                    let done = self.stack.pop().unwrap();
                    let _ = self.fs.close(done.handle);
                    continue;
                }
                let line = self.src().line;
                self.emit(Token::eof(line))?;
                return Ok(());
            };
            let token = self.scan(b, line, col)?;
            if let Some(t) = token {
                self.emit(t)?;
            }
            if self.diags.len() >= MAX_DIAGS {
                return Ok(());
            }
        }
    }

    fn src(&mut self) -> &mut Source {
        self.stack.last_mut().unwrap()
    }

    fn next(&mut self) -> Result<Option<u8>, Error> {
        let src = self.stack.last_mut().unwrap();
        src.next(self.fs).map_err(Error::from)
    }

    fn peek(&mut self) -> Result<Option<u8>, Error> {
        let src = self.stack.last_mut().unwrap();
        src.peek(self.fs).map_err(Error::from)
    }

    fn error(&mut self, line: u16, col: u16, message: String) {
        if self.diags.len() < MAX_DIAGS {
            self.diags.push(Diag { line, col, message });
        }
    }

    /// Skips whitespace, comments, and directive lines. Returns the first
    /// byte of the next token plus its position, or `None` at end of file.
    fn skip_trivia(&mut self) -> Result<Option<(u8, u16, u16)>, Error> {
        loop {
            let Some(b) = self.next()? else {
                return Ok(None);
            };
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => continue,
                b'/' => match self.peek()? {
                    Some(b'/') => {
                        while let Some(c) = self.next()? {
                            if c == b'\n' {
                                break;
                            }
                        }
                    }
                    Some(b'*') => {
                        let (line, col) =
                            (self.src().line, self.src().col);
                        self.next()?; // the '*'
                        let mut star = false;
                        let mut closed = false;
                        while let Some(c) = self.next()? {
                            if star && c == b'/' {
                                closed = true;
                                break;
                            }
                            star = c == b'*';
                        }
                        if !closed {
                            self.error(
                                line,
                                col,
                                "unterminated block comment".into(),
                            );
                            return Ok(None);
                        }
                    }
                    _ => {
                        let (line, col) = (self.src().line, self.src().col);
                        self.src().bol = false;
                        return Ok(Some((b'/', line, col)));
                    }
                },
                b'#' if self.src().bol => self.directive()?,
                _ => {
                    let (line, col) = (self.src().line, self.src().col);
                    self.src().bol = false;
                    return Ok(Some((b, line, col)));
                }
            }
        }
    }

    fn skip_to_eol(&mut self) -> Result<(), Error> {
        while let Some(c) = self.peek()? {
            if c == b'\n' {
                break;
            }
            self.next()?;
        }
        Ok(())
    }

    fn directive(&mut self) -> Result<(), Error> {
        let (line, col) = (self.src().line, self.src().col);
        while self.peek()? == Some(b' ') || self.peek()? == Some(b'\t') {
            self.next()?;
        }
        let mut name = String::new();
        while let Some(c) = self.peek()? {
            if c.is_ascii_alphabetic() {
                name.push(c as char);
                self.next()?;
            } else {
                break;
            }
        }
        match name.as_str() {
            "include" => self.include(line, col)?,
            "define" | "ifdef" | "ifndef" | "else" | "endif" | "pragma" => {
                // Parsed, no semantic effect.
                self.skip_to_eol()?;
            }
            _ => {
                self.error(line, col, format!("unknown directive #{name}"));
                self.skip_to_eol()?;
            }
        }
        Ok(())
    }

    fn include(&mut self, line: u16, col: u16) -> Result<(), Error> {
        while self.peek()? == Some(b' ') || self.peek()? == Some(b'\t') {
            self.next()?;
        }
        let close = match self.next()? {
            Some(b'"') => b'"',
            Some(b'<') => b'>',
            _ => {
                self.error(line, col, "malformed #include".into());
                return self.skip_to_eol();
            }
        };
        let mut path = String::new();
        loop {
            match self.next()? {
                Some(c) if c == close => break,
                Some(b'\n') | None => {
                    self.error(line, col, "unterminated #include".into());
                    return Ok(());
                }
                Some(c) => path.push(c as char),
            }
        }
        self.skip_to_eol()?;
        // The filename is recorded either way; only the quoted form loads
        // content, since the device has no system include tree.
        self.strtab.intern(&path);
        if close == b'>' {
            return Ok(());
        }
        if self.stack.len() >= INCLUDE_DEPTH {
            self.error(line, col, "includes nested too deeply".into());
            return Ok(());
        }
        match self.fs.open(&path, OpenMode::READ) {
            Ok(h) => self.stack.push(Source::new(h)),
            Err(_) => {
                self.error(line, col, format!("include not found: {path}"));
            }
        }
        Ok(())
    }

    fn scan(
        &mut self,
        b: u8,
        line: u16,
        col: u16,
    ) -> Result<Option<Token>, Error> {
        if b.is_ascii_digit() {
            return self.number(b, line).map(Some);
        }
        if b == b'_' || b.is_ascii_alphabetic() {
            return self.ident(b, line).map(Some);
        }
        match b {
            b'"' => self.string(line, col).map(Some),
            b'\'' => self.char_lit(line, col).map(Some),
            _ => self.punct(b, line, col),
        }
    }

    fn number(&mut self, first: u8, line: u16) -> Result<Token, Error> {
        let mut value: u32 = 0;
        let mut base = 10;
        if first == b'0' {
            match self.peek()? {
                Some(b'x') | Some(b'X') => {
                    base = 16;
                    self.next()?;
                }
                Some(c) if c.is_ascii_digit() => base = 8,
                _ => {}
            }
        } else {
            value = u32::from(first - b'0');
        }
        loop {
            let Some(c) = self.peek()? else { break };
            let digit = match c {
                b'0'..=b'9' => u32::from(c - b'0'),
                b'a'..=b'f' if base == 16 => u32::from(c - b'a') + 10,
                b'A'..=b'F' if base == 16 => u32::from(c - b'A') + 10,
                _ => break,
            };
            // Overflow is not an error; values wrap in 32-bit arithmetic.
            value = value.wrapping_mul(base).wrapping_add(digit);
            self.next()?;
        }
        // Integer suffixes are consumed and discarded.
        while matches!(self.peek()?, Some(b'u' | b'U' | b'l' | b'L')) {
            self.next()?;
        }
        Ok(Token {
            kind: TokenKind::Num,
            flags: 0,
            line,
            value,
        })
    }

    fn ident(&mut self, first: u8, line: u16) -> Result<Token, Error> {
        let mut name = String::new();
        name.push(first as char);
        while let Some(c) = self.peek()? {
            if c == b'_' || c.is_ascii_alphanumeric() {
                name.push(c as char);
                self.next()?;
            } else {
                break;
            }
        }
        if let Some(kind) = keyword(&name) {
            return Ok(Token {
                kind,
                flags: 0,
                line,
                value: 0,
            });
        }
        let off = self.strtab.intern(&name);
        Ok(Token {
            kind: TokenKind::Ident,
            flags: FLAG_STRTAB,
            line,
            value: off,
        })
    }

    /// Decodes one escape sequence body (the byte after `\`).
    fn escape(c: u8) -> u8 {
        match c {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            // Unknown escapes pass the literal character through.
            _ => c,
        }
    }

    fn string(&mut self, line: u16, col: u16) -> Result<Token, Error> {
        let mut body = Vec::new();
        loop {
            match self.next()? {
                None | Some(b'\n') => {
                    self.error(line, col, "unterminated string literal".into());
                    break;
                }
                Some(b'"') => break,
                Some(b'\\') => match self.next()? {
                    None => {
                        self.error(
                            line,
                            col,
                            "unterminated string literal".into(),
                        );
                        break;
                    }
                    Some(c) => body.push(Self::escape(c)),
                },
                Some(c) => body.push(c),
            }
        }
        let text = String::from_utf8_lossy(&body);
        let off = self.strtab.intern(&text);
        Ok(Token {
            kind: TokenKind::Str,
            flags: FLAG_STRTAB,
            line,
            value: off,
        })
    }

    fn char_lit(&mut self, line: u16, col: u16) -> Result<Token, Error> {
        let value = match self.next()? {
            None | Some(b'\n') | Some(b'\'') => {
                self.error(line, col, "empty character literal".into());
                0
            }
            Some(b'\\') => match self.next()? {
                Some(c) => u32::from(Self::escape(c)),
                None => 0,
            },
            Some(c) => u32::from(c),
        };
        match self.next()? {
            Some(b'\'') => {}
            _ => {
                self.error(
                    line,
                    col,
                    "unterminated or multi-byte character literal".into(),
                );
                // Resynchronise at the closing quote or end of line.
                while let Some(c) = self.peek()? {
                    if c == b'\n' {
                        break;
                    }
                    self.next()?;
                    if c == b'\'' {
                        break;
                    }
                }
            }
        }
        Ok(Token {
            kind: TokenKind::CharLit,
            flags: 0,
            line,
            value,
        })
    }

    /// Longest-match punctuator scan, built incrementally from
    /// peek-by-one: two-character operators first check whether a third
    /// character extends them.
    fn punct(
        &mut self,
        first: u8,
        line: u16,
        col: u16,
    ) -> Result<Option<Token>, Error> {
        let mk = |kind| Token {
            kind,
            flags: 0,
            line,
            value: 0,
        };
        // "..." needs two units of lookahead; handle it by hand.
        if first == b'.' {
            if self.peek()? == Some(b'.') {
                self.next()?;
                if self.peek()? == Some(b'.') {
                    self.next()?;
                    return Ok(Some(mk(TokenKind::Ellipsis)));
                }
                self.src().unread(b'.');
            }
            return Ok(Some(mk(TokenKind::Dot)));
        }
        if let Some(second) = self.peek()? {
            for (pat, kind) in crate::token::PUNCT2 {
                if pat[0] == first && pat[1] == second {
                    self.next()?;
                    let mut kind = *kind;
                    // <<= and >>= extend << and >>.
                    if self.peek()? == Some(b'=') {
                        if kind == TokenKind::Shl {
                            self.next()?;
                            kind = TokenKind::ShlEq;
                        } else if kind == TokenKind::Shr {
                            self.next()?;
                            kind = TokenKind::ShrEq;
                        }
                    }
                    return Ok(Some(mk(kind)));
                }
            }
        }
        match punct1(first) {
            Some(kind) => Ok(Some(mk(kind))),
            None => {
                self.error(
                    line,
                    col,
                    format!("stray character 0x{first:02x}"),
                );
                Ok(None)
            }
        }
    }

    fn emit(&mut self, t: Token) -> Result<(), Error> {
        self.count += 1;
        let bytes = t.to_bytes();
        self.write_out(&bytes)
    }

    fn write_out(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.fs.write(self.out, bytes)?;
        Ok(())
    }

    /// Appends the string table, rewrites the header, and closes every
    /// handle, on success and failure alike.
    fn finish(mut self, run: Result<(), Error>) -> Result<LexStats, Error> {
        let tail = run.and_then(|()| {
            let strtab_len = self.strtab.len();
            let table = self.strtab.as_bytes().to_vec();
            self.write_out(&table)?;
            self.fs.seek(self.out, 0, Whence::Set)?;
            let header = StreamHeader {
                token_count: self.count,
                strtab_len,
            };
            self.write_out(&header.to_bytes())?;
            Ok(LexStats {
                tokens: self.count,
                strtab_len,
            })
        });

        for src in self.stack.drain(..) {
            let _ = self.fs.close(src.handle);
        }
        let _ = self.fs.close(self.out);

        let stats = tail?;
        if !self.diags.is_empty() {
            return Err(Error::Syntax(core::mem::take(&mut self.diags)));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_api::RamDisk;

    fn lex(source: &str) -> Result<(Vec<Token>, StrTab), Error> {
        let mut disk = RamDisk::new();
        disk.put("t.c", source.as_bytes());
        lex_on(&mut disk, source)
    }

    fn lex_on(
        disk: &mut RamDisk,
        source: &str,
    ) -> Result<(Vec<Token>, StrTab), Error> {
        disk.put("t.c", source.as_bytes());
        lex_to_stream(disk, "t.c", "t.tok")?;
        let bytes = disk.contents("t.tok").unwrap().to_vec();
        let header = StreamHeader::from_bytes(&bytes).unwrap();
        let mut tokens = Vec::new();
        for i in 0..header.token_count as usize {
            let off = STREAM_HEADER_LEN + i * crate::token::TOKEN_LEN;
            tokens.push(Token::from_bytes(&bytes[off..]).unwrap());
        }
        let strtab_start =
            STREAM_HEADER_LEN + tokens.len() * crate::token::TOKEN_LEN;
        let strtab = StrTab::from_bytes(bytes[strtab_start..].to_vec());
        assert_eq!(strtab.len(), header.strtab_len);
        Ok((tokens, strtab))
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn basic_stream() {
        let (tokens, strtab) = lex("int main() { return 42; }").unwrap();
        use TokenKind::*;
        assert_eq!(
            kinds(&tokens),
            vec![
                KwInt, Ident, LParen, RParen, LBrace, KwReturn, Num, Semi,
                RBrace, Eof
            ]
        );
        assert_eq!(strtab.get(tokens[1].value), "main");
        assert_eq!(tokens[6].value, 42);
    }

    #[test]
    fn number_bases_and_suffixes() {
        let (tokens, _) = lex("0x1F 017 255 0 42UL").unwrap();
        let values: Vec<u32> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Num)
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec![0x1F, 0o17, 255, 0, 42]);
    }

    #[test]
    fn hex_wraps_at_32_bits() {
        let (tokens, _) = lex("0x1FFFFFFFF").unwrap();
        assert_eq!(tokens[0].value, 0xFFFF_FFFF);
    }

    #[test]
    fn string_escapes() {
        let (tokens, strtab) = lex(r#""a\tb\n\q\\" 'x' '\n'"#).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(strtab.get(tokens[0].value), "a\tb\nq\\");
        assert_eq!(tokens[1].kind, TokenKind::CharLit);
        assert_eq!(tokens[1].value, u32::from(b'x'));
        assert_eq!(tokens[2].value, u32::from(b'\n'));
    }

    #[test]
    fn punctuator_longest_match() {
        let (tokens, _) = lex("a <<= b >> c <= d ... e . f ++g").unwrap();
        use TokenKind::*;
        assert_eq!(
            kinds(&tokens),
            vec![
                Ident, ShlEq, Ident, Shr, Ident, Le, Ident, Ellipsis, Ident,
                Dot, Ident, PlusPlus, Ident, Eof
            ]
        );
    }

    #[test]
    fn comments_and_lines() {
        let src = "int a; // trailing\n/* block\nspanning */ int b;";
        let (tokens, _) = lex(src).unwrap();
        assert_eq!(tokens[0].line, 1);
        // `int b` is on line 3.
        assert_eq!(tokens[3].line, 3);
    }

    #[test]
    fn unterminated_block_comment_is_an_error() {
        let err = lex("int a; /* no close").unwrap_err();
        match err {
            Error::Syntax(diags) => {
                assert!(diags[0].message.contains("unterminated block"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = lex("char *s = \"oops\nint x;").unwrap_err();
        match err {
            Error::Syntax(diags) => {
                assert!(diags[0].message.contains("unterminated string"));
                assert_eq!(diags[0].line, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn quoted_include_is_inlined() {
        let mut disk = RamDisk::new();
        disk.put("defs.h", b"int helper();\n");
        let (tokens, strtab) =
            lex_on(&mut disk, "#include \"defs.h\"\nint main() {}").unwrap();
        // The helper prototype tokens precede main's.
        let names: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Ident)
            .map(|t| strtab.get(t.value))
            .collect();
        assert_eq!(names, vec!["helper", "main"]);
    }

    #[test]
    fn angle_include_and_directives_are_inert() {
        let (tokens, _) =
            lex("#include <stdio.h>\n#define X 1\n#pragma woo\nint a;")
                .unwrap();
        use TokenKind::*;
        assert_eq!(kinds(&tokens), vec![KwInt, Ident, Semi, Eof]);
    }

    #[test]
    fn unknown_directive_is_recoverable() {
        let err = lex("#wat is this\nint a;").unwrap_err();
        match err {
            Error::Syntax(diags) => {
                assert!(diags[0].message.contains("unknown directive"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_include_is_reported() {
        let err = lex("#include \"nope.h\"\n").unwrap_err();
        match err {
            Error::Syntax(diags) => {
                assert!(diags[0].message.contains("include not found"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
