// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Token model and the on-disk token stream.
//!
//! The compiler is disk-buffered: the lexer writes the whole token sequence
//! to a temporary file and the parser streams it back, so source text and
//! parse state never coexist in memory. A token is eight bytes on disk:
//! `{kind: u8, flags: u8, line: u16, value: u32}`, little-endian, preceded
//! in the file by a small header and followed by the string table.

use byteorder::{ByteOrder, LittleEndian};
use core::convert::TryFrom;

/// `"MTOK"` read as a little-endian u32; first bytes of a token stream.
pub const STREAM_MAGIC: u32 = 0x4B4F_544D;

/// Size of the token stream file header.
pub const STREAM_HEADER_LEN: usize = 16;

/// Size of one on-disk token.
pub const TOKEN_LEN: usize = 8;

/// Set in `flags` when `value` is a string-table offset rather than an
/// immediate.
pub const FLAG_STRTAB: u8 = 1 << 0;

/// Token kinds: literals, identifiers, the C89 keyword set, and one- to
/// three-character punctuators.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TokenKind {
    Eof = 0,
    Num = 1,
    CharLit = 2,
    Str = 3,
    Ident = 4,

    KwVoid = 10,
    KwChar = 11,
    KwShort = 12,
    KwInt = 13,
    KwLong = 14,
    KwSigned = 15,
    KwUnsigned = 16,
    KwFloat = 17,
    KwDouble = 18,
    KwConst = 19,
    KwVolatile = 20,
    KwStatic = 21,
    KwExtern = 22,
    KwTypedef = 23,
    KwRegister = 24,
    KwAuto = 25,
    KwStruct = 26,
    KwUnion = 27,
    KwEnum = 28,
    KwIf = 29,
    KwElse = 30,
    KwWhile = 31,
    KwDo = 32,
    KwFor = 33,
    KwReturn = 34,
    KwBreak = 35,
    KwContinue = 36,
    KwSwitch = 37,
    KwCase = 38,
    KwDefault = 39,
    KwGoto = 40,
    KwSizeof = 41,

    LParen = 50,
    RParen = 51,
    LBrace = 52,
    RBrace = 53,
    LBracket = 54,
    RBracket = 55,
    Semi = 56,
    Comma = 57,
    Colon = 58,
    Question = 59,
    Plus = 60,
    Minus = 61,
    Star = 62,
    Slash = 63,
    Percent = 64,
    Amp = 65,
    Pipe = 66,
    Caret = 67,
    Tilde = 68,
    Bang = 69,
    Lt = 70,
    Gt = 71,
    Assign = 72,
    Dot = 73,

    PlusPlus = 80,
    MinusMinus = 81,
    Shl = 82,
    Shr = 83,
    Le = 84,
    Ge = 85,
    EqEq = 86,
    Ne = 87,
    AndAnd = 88,
    OrOr = 89,
    PlusEq = 90,
    MinusEq = 91,
    StarEq = 92,
    SlashEq = 93,
    PercentEq = 94,
    AmpEq = 95,
    PipeEq = 96,
    CaretEq = 97,
    ShlEq = 98,
    ShrEq = 99,
    Arrow = 100,
    Ellipsis = 101,
}

impl TryFrom<u8> for TokenKind {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        use TokenKind::*;
        Ok(match x {
            0 => Eof,
            1 => Num,
            2 => CharLit,
            3 => Str,
            4 => Ident,
            10 => KwVoid,
            11 => KwChar,
            12 => KwShort,
            13 => KwInt,
            14 => KwLong,
            15 => KwSigned,
            16 => KwUnsigned,
            17 => KwFloat,
            18 => KwDouble,
            19 => KwConst,
            20 => KwVolatile,
            21 => KwStatic,
            22 => KwExtern,
            23 => KwTypedef,
            24 => KwRegister,
            25 => KwAuto,
            26 => KwStruct,
            27 => KwUnion,
            28 => KwEnum,
            29 => KwIf,
            30 => KwElse,
            31 => KwWhile,
            32 => KwDo,
            33 => KwFor,
            34 => KwReturn,
            35 => KwBreak,
            36 => KwContinue,
            37 => KwSwitch,
            38 => KwCase,
            39 => KwDefault,
            40 => KwGoto,
            41 => KwSizeof,
            50 => LParen,
            51 => RParen,
            52 => LBrace,
            53 => RBrace,
            54 => LBracket,
            55 => RBracket,
            56 => Semi,
            57 => Comma,
            58 => Colon,
            59 => Question,
            60 => Plus,
            61 => Minus,
            62 => Star,
            63 => Slash,
            64 => Percent,
            65 => Amp,
            66 => Pipe,
            67 => Caret,
            68 => Tilde,
            69 => Bang,
            70 => Lt,
            71 => Gt,
            72 => Assign,
            73 => Dot,
            80 => PlusPlus,
            81 => MinusMinus,
            82 => Shl,
            83 => Shr,
            84 => Le,
            85 => Ge,
            86 => EqEq,
            87 => Ne,
            88 => AndAnd,
            89 => OrOr,
            90 => PlusEq,
            91 => MinusEq,
            92 => StarEq,
            93 => SlashEq,
            94 => PercentEq,
            95 => AmpEq,
            96 => PipeEq,
            97 => CaretEq,
            98 => ShlEq,
            99 => ShrEq,
            100 => Arrow,
            101 => Ellipsis,
            _ => return Err(()),
        })
    }
}

/// The C89 keywords, strict case-sensitive match.
pub const KEYWORDS: &[(&str, TokenKind)] = &[
    ("auto", TokenKind::KwAuto),
    ("break", TokenKind::KwBreak),
    ("case", TokenKind::KwCase),
    ("char", TokenKind::KwChar),
    ("const", TokenKind::KwConst),
    ("continue", TokenKind::KwContinue),
    ("default", TokenKind::KwDefault),
    ("do", TokenKind::KwDo),
    ("double", TokenKind::KwDouble),
    ("else", TokenKind::KwElse),
    ("enum", TokenKind::KwEnum),
    ("extern", TokenKind::KwExtern),
    ("float", TokenKind::KwFloat),
    ("for", TokenKind::KwFor),
    ("goto", TokenKind::KwGoto),
    ("if", TokenKind::KwIf),
    ("int", TokenKind::KwInt),
    ("long", TokenKind::KwLong),
    ("register", TokenKind::KwRegister),
    ("return", TokenKind::KwReturn),
    ("short", TokenKind::KwShort),
    ("signed", TokenKind::KwSigned),
    ("sizeof", TokenKind::KwSizeof),
    ("static", TokenKind::KwStatic),
    ("struct", TokenKind::KwStruct),
    ("switch", TokenKind::KwSwitch),
    ("typedef", TokenKind::KwTypedef),
    ("union", TokenKind::KwUnion),
    ("unsigned", TokenKind::KwUnsigned),
    ("void", TokenKind::KwVoid),
    ("volatile", TokenKind::KwVolatile),
    ("while", TokenKind::KwWhile),
];

pub fn keyword(ident: &str) -> Option<TokenKind> {
    KEYWORDS
        .binary_search_by_key(&ident, |(name, _)| name)
        .ok()
        .map(|i| KEYWORDS[i].1)
}

/// Two-character punctuators. The lexer derives `<<=` and `>>=` by
/// extending a match from this table, and assembles `...` from dots.
pub const PUNCT2: &[(&[u8; 2], TokenKind)] = &[
    (b"++", TokenKind::PlusPlus),
    (b"--", TokenKind::MinusMinus),
    (b"<<", TokenKind::Shl),
    (b">>", TokenKind::Shr),
    (b"<=", TokenKind::Le),
    (b">=", TokenKind::Ge),
    (b"==", TokenKind::EqEq),
    (b"!=", TokenKind::Ne),
    (b"&&", TokenKind::AndAnd),
    (b"||", TokenKind::OrOr),
    (b"+=", TokenKind::PlusEq),
    (b"-=", TokenKind::MinusEq),
    (b"*=", TokenKind::StarEq),
    (b"/=", TokenKind::SlashEq),
    (b"%=", TokenKind::PercentEq),
    (b"&=", TokenKind::AmpEq),
    (b"|=", TokenKind::PipeEq),
    (b"^=", TokenKind::CaretEq),
    (b"->", TokenKind::Arrow),
];

pub fn punct1(c: u8) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match c {
        b'(' => LParen,
        b')' => RParen,
        b'{' => LBrace,
        b'}' => RBrace,
        b'[' => LBracket,
        b']' => RBracket,
        b';' => Semi,
        b',' => Comma,
        b':' => Colon,
        b'?' => Question,
        b'+' => Plus,
        b'-' => Minus,
        b'*' => Star,
        b'/' => Slash,
        b'%' => Percent,
        b'&' => Amp,
        b'|' => Pipe,
        b'^' => Caret,
        b'~' => Tilde,
        b'!' => Bang,
        b'<' => Lt,
        b'>' => Gt,
        b'=' => Assign,
        b'.' => Dot,
        _ => return None,
    })
}

/// One token. `value` is the literal value for `Num`/`CharLit` and a
/// string-table offset for `Str`/`Ident` (with [`FLAG_STRTAB`] set).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub flags: u8,
    /// 1-based source line the token started on.
    pub line: u16,
    pub value: u32,
}

impl Token {
    pub fn eof(line: u16) -> Self {
        Self {
            kind: TokenKind::Eof,
            flags: 0,
            line,
            value: 0,
        }
    }

    pub fn to_bytes(self) -> [u8; TOKEN_LEN] {
        let mut b = [0; TOKEN_LEN];
        b[0] = self.kind as u8;
        b[1] = self.flags;
        LittleEndian::write_u16(&mut b[2..4], self.line);
        LittleEndian::write_u32(&mut b[4..8], self.value);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < TOKEN_LEN {
            return None;
        }
        Some(Self {
            kind: TokenKind::try_from(b[0]).ok()?,
            flags: b[1],
            line: LittleEndian::read_u16(&b[2..4]),
            value: LittleEndian::read_u32(&b[4..8]),
        })
    }
}

/// Token stream file header: magic, token count, string-table length, pad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StreamHeader {
    pub token_count: u32,
    pub strtab_len: u32,
}

impl StreamHeader {
    pub fn to_bytes(self) -> [u8; STREAM_HEADER_LEN] {
        let mut b = [0; STREAM_HEADER_LEN];
        LittleEndian::write_u32(&mut b[0..4], STREAM_MAGIC);
        LittleEndian::write_u32(&mut b[4..8], self.token_count);
        LittleEndian::write_u32(&mut b[8..12], self.strtab_len);
        b
    }

    /// `None` on a short buffer or wrong magic: a bad token stream header
    /// is CORRUPT at the caller.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < STREAM_HEADER_LEN
            || LittleEndian::read_u32(&b[0..4]) != STREAM_MAGIC
        {
            return None;
        }
        Some(Self {
            token_count: LittleEndian::read_u32(&b[4..8]),
            strtab_len: LittleEndian::read_u32(&b[8..12]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_sorted_for_binary_search() {
        for w in KEYWORDS.windows(2) {
            assert!(w[0].0 < w[1].0, "{} !< {}", w[0].0, w[1].0);
        }
        assert_eq!(keyword("while"), Some(TokenKind::KwWhile));
        assert_eq!(keyword("While"), None);
        assert_eq!(keyword("whil"), None);
    }

    #[test]
    fn token_round_trips() {
        let t = Token {
            kind: TokenKind::Num,
            flags: 0,
            line: 42,
            value: 0xDEAD_BEEF,
        };
        assert_eq!(Token::from_bytes(&t.to_bytes()), Some(t));
    }

    #[test]
    fn bad_kind_byte_is_rejected() {
        let mut b = Token::eof(1).to_bytes();
        b[0] = 200;
        assert_eq!(Token::from_bytes(&b), None);
    }

    #[test]
    fn stream_header_checks_magic() {
        let h = StreamHeader {
            token_count: 7,
            strtab_len: 99,
        };
        let b = h.to_bytes();
        assert_eq!(&b[0..4], b"MTOK");
        assert_eq!(StreamHeader::from_bytes(&b), Some(h));
        let mut bad = b;
        bad[0] = b'X';
        assert_eq!(StreamHeader::from_bytes(&bad), None);
    }
}
