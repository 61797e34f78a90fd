// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The parse tree.
//!
//! Nodes live in flat arenas addressed by `u32` ids; a node refers to its
//! children by id, never by owning pointer. Everything is released at once
//! when the compile invocation drops the [`Ast`].

/// Index of an expression node.
pub type ExprId = u32;

/// Index of a statement node.
pub type StmtId = u32;

/// The resolved C type of a declaration, deliberately small: base type
/// plus pointer depth plus optional array bound. Everything integral folds
/// to `Int`; `float`/`double` parse but are rejected in codegen.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CType {
    pub base: Base,
    /// Levels of `*`.
    pub ptr: u8,
    /// Declared array bound, for declarators like `int a[10]`.
    pub array: Option<u32>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Base {
    Void,
    Char,
    Int,
    Float,
}

impl CType {
    pub const INT: Self = Self {
        base: Base::Int,
        ptr: 0,
        array: None,
    };

    pub const VOID: Self = Self {
        base: Base::Void,
        ptr: 0,
        array: None,
    };

    pub fn ptr_to(self) -> Self {
        Self {
            ptr: self.ptr + 1,
            array: None,
            ..self
        }
    }

    /// Size of one element of this type (the pointee for arrays).
    pub fn elem_size(self) -> u32 {
        if self.ptr > 0 {
            4
        } else {
            match self.base {
                Base::Char => 1,
                Base::Void => 1,
                _ => 4,
            }
        }
    }

    /// Total size: element size times the array bound, if any.
    pub fn size(self) -> u32 {
        self.elem_size() * self.array.unwrap_or(1)
    }

    /// The type of `*self` / `self[i]`.
    pub fn deref(self) -> Self {
        if self.array.is_some() {
            Self {
                array: None,
                ..self
            }
        } else if self.ptr > 0 {
            Self {
                ptr: self.ptr - 1,
                ..self
            }
        } else {
            self
        }
    }

    /// True when additive operators must scale the other operand.
    pub fn is_pointerish(self) -> bool {
        self.ptr > 0 || self.array.is_some()
    }

    /// Size the other operand of `+`/`-` is scaled by.
    pub fn scale(self) -> u32 {
        if self.array.is_some() || self.ptr == 1 {
            self.deref().elem_size()
        } else {
            4
        }
    }

    /// True for loads/stores that move a single byte.
    pub fn is_byte(self) -> bool {
        self.ptr == 0 && self.array.is_none() && self.base == Base::Char
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnOp {
    /// `-e`
    Neg,
    /// `!e`
    Not,
    /// `~e`
    BitNot,
    /// `*e`
    Deref,
    /// `&e`
    Addr,
    /// `++e` / `--e`
    PreInc,
    PreDec,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogAnd,
    LogOr,
}

/// Expression node payloads. String-valued fields are string-table offsets.
#[derive(Clone, Debug)]
pub enum Expr {
    Num(u32),
    /// String literal; the value is its table offset.
    Str(u32),
    Ident(u32),
    Unary {
        op: UnOp,
        rhs: ExprId,
    },
    Binary {
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    /// `lhs = rhs`, or `lhs op= rhs` when `op` is set.
    Assign {
        op: Option<BinOp>,
        lhs: ExprId,
        rhs: ExprId,
    },
    Ternary {
        cond: ExprId,
        then_: ExprId,
        else_: ExprId,
    },
    Comma {
        lhs: ExprId,
        rhs: ExprId,
    },
    Call {
        /// Callee name; only direct calls by identifier are supported.
        name: u32,
        args: Vec<ExprId>,
    },
    Index {
        base: ExprId,
        index: ExprId,
    },
    /// `e++` / `e--`
    Postfix {
        dec: bool,
        lhs: ExprId,
    },
    /// `sizeof(type)` or `sizeof expr`, already folded to a constant.
    Sizeof(u32),
    /// Parsed but unsupported construct (member access, cast of a struct,
    /// ...); codegen reports NOSYS with this label.
    Unsupported(&'static str),
}

/// Statement node payloads.
#[derive(Clone, Debug)]
pub enum Stmt {
    Empty,
    Expr(ExprId),
    Decl {
        name: u32,
        ty: CType,
        init: Option<ExprId>,
    },
    Compound(Vec<StmtId>),
    If {
        cond: ExprId,
        then_: StmtId,
        else_: Option<StmtId>,
    },
    While {
        cond: ExprId,
        body: StmtId,
    },
    DoWhile {
        body: StmtId,
        cond: ExprId,
    },
    For {
        init: Option<StmtId>,
        cond: Option<ExprId>,
        step: Option<ExprId>,
        body: StmtId,
    },
    Return(Option<ExprId>),
    Break,
    Continue,
    /// switch/case/goto/label: parsed, rejected by codegen.
    Unsupported(&'static str),
}

#[derive(Clone, Debug)]
pub struct ExprNode {
    pub kind: Expr,
    pub line: u16,
}

#[derive(Clone, Debug)]
pub struct StmtNode {
    pub kind: Stmt,
    pub line: u16,
}

/// Both arenas.
#[derive(Default, Debug)]
pub struct Ast {
    exprs: Vec<ExprNode>,
    stmts: Vec<StmtNode>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expr(&mut self, kind: Expr, line: u16) -> ExprId {
        self.exprs.push(ExprNode { kind, line });
        (self.exprs.len() - 1) as ExprId
    }

    pub fn stmt(&mut self, kind: Stmt, line: u16) -> StmtId {
        self.stmts.push(StmtNode { kind, line });
        (self.stmts.len() - 1) as StmtId
    }

    pub fn e(&self, id: ExprId) -> &ExprNode {
        &self.exprs[id as usize]
    }

    pub fn s(&self, id: StmtId) -> &StmtNode {
        &self.stmts[id as usize]
    }
}

/// One function parameter.
#[derive(Copy, Clone, Debug)]
pub struct Param {
    pub name: u32,
    pub ty: CType,
}

/// A function definition (prototypes don't reach this list).
#[derive(Clone, Debug)]
pub struct FuncDef {
    pub name: u32,
    pub params: Vec<Param>,
    pub ret: CType,
    pub body: StmtId,
    pub is_static: bool,
    pub line: u16,
}

/// How a global's initial value is expressed.
#[derive(Copy, Clone, Debug)]
pub enum GlobalInit {
    /// A constant-folded integer.
    Const(u32),
    /// A string literal, by string-table offset; the global becomes a
    /// pointer to its bytes.
    Str(u32),
}

/// A global variable definition.
#[derive(Clone, Debug)]
pub struct GlobalDef {
    pub name: u32,
    pub ty: CType,
    pub init: Option<GlobalInit>,
    pub is_static: bool,
    pub line: u16,
}

/// Everything the parser hands to the code generator for one translation
/// unit.
#[derive(Default, Debug)]
pub struct Unit {
    pub ast: Ast,
    pub funcs: Vec<FuncDef>,
    pub globals: Vec<GlobalDef>,
    /// Names declared (prototyped) but not defined here; informational.
    pub protos: Vec<u32>,
}
