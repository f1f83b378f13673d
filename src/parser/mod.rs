//! The textual descriptor format (`.segop` files).
//!
//! A file declares the host environment (`array`, `scalar` and `const` items) followed by host
//! operations: built-in fills and copies, and segmented operations bound with `let`.
//!
//! ```text
//! scalar n: i64;
//! array xs: [n]i32;
//! let total: [1]i32 = segred@thread(4, 64) flat(i < n)
//!     [commutative op(\x: i32, y: i32 -> x + y; 0i32)] {
//!   let x: i32 = xs[i];
//!   return x
//! };
//! ```

mod helpers;
pub mod source;

pub use source::SourceCode;

use crate::error::{Diagnostic, ErrorReported, Location};
use crate::ir::{BinOp, CmpOp, Exp, PrimType, PrimValue, Span, UnOp, VName};
use crate::segop::{
    BodyStm, HistOp, HostOp, KernelBody, KernelResult, Lambda, Level, Module, Param, PatElem,
    SegBinOp, SegLevel, SegOp, SegOpKind, SegSpace, SegVirt, Split, SubExp,
};
use helpers::Item;
use peg::{error::ParseError, str::LineCol};

peg::parser! {
    pub(crate) grammar descriptor() for str {

        pub(crate) rule module() -> Module
            = _ items:(item() ** _) _ ![_] { helpers::build_module(items) }

        rule item() -> Item
            = "array" __ name:identifier() _ ":" _ shape:shape() ty:prim_type() _ ";" {
                Item::Array(VName::new(&name), ty, shape)
            }
            / "scalar" __ name:identifier() _ ":" _ ty:prim_type() _ ";" {
                Item::Scalar(VName::new(&name), ty)
            }
            / "const" __ name:identifier() _ ":" _ ty:prim_type() _ "=" _
                value:typed_literal(ty) _ ";"
            {
                Item::Const(VName::new(&name), value)
            }
            / dest:identifier() _ "=" _ "replicate" _ "(" _ value:subexp() _ ")" _ ";" {
                Item::Op(HostOp::Replicate { dest: VName::new(&dest), value })
            }
            / dest:identifier() _ "=" _ "iota" _ "(" _ start:subexp() _ "," _ step:subexp() _ ")"
                _ ";"
            {
                Item::Op(HostOp::Iota { dest: VName::new(&dest), start, step })
            }
            / dest:identifier() _ "=" _ "copy" _ "(" _ src:identifier() _ ")" _ ";" {
                Item::Op(HostOp::Copy { dest: VName::new(&dest), src: VName::new(&src) })
            }
            / "let" __ pat:pattern() _ "=" _ op:segop() _ ";" {
                Item::Op(HostOp::Seg { pat, op })
            }

        rule pattern() -> Vec<PatElem>
            = pat_elem() ++ (_ "," _)

        rule pat_elem() -> PatElem
            = name:identifier() _ ":" _ shape:shape() ty:prim_type() {
                PatElem { name: VName::new(&name), ty, shape }
            }

        rule shape() -> Vec<SubExp>
            = dims:("[" _ d:subexp() _ "]" _ { d })* { dims }

        /// A segmented operation
        pub(crate) rule segop() -> SegOp
            = begin:position!() op:(
                "segmap" "@" level:seg_level() _ space:seg_space() _ body:kernel_body() {
                    (SegOpKind::Map, level, space, body)
                }
                / "segred" "@" level:seg_level() _ space:seg_space() _ ops:bin_ops() _
                    body:kernel_body()
                {
                    (SegOpKind::Red(ops), level, space, body)
                }
                / "segscan" "@" level:seg_level() _ space:seg_space() _ ops:bin_ops() _
                    body:kernel_body()
                {
                    (SegOpKind::Scan(ops), level, space, body)
                }
                / "seghist" "@" level:seg_level() _ space:seg_space() _ ops:hist_ops() _
                    body:kernel_body()
                {
                    (SegOpKind::Hist(ops), level, space, body)
                }
            ) end:position!() {
                let (kind, level, space, body) = op;
                SegOp { kind, level, space, body, span: Some(Span::new(begin, end)) }
            }

        /// `thread` or `group`, optionally with `(num_groups, group_size)` and a virtualization
        /// mode. Nested operations run with the sizes of their enclosing kernel.
        rule seg_level() -> SegLevel
            = level:("thread" { Level::Thread } / "group" { Level::Group })
                sizes:(_ "(" _ ng:subexp() _ "," _ gs:subexp() _ ")" { (ng, gs) })?
                virt:(__ v:seg_virt() { v })?
            {
                let (num_groups, group_size) = sizes.unwrap_or((SubExp::int(1), SubExp::int(1)));
                SegLevel { level, num_groups, group_size, virt: virt.unwrap_or(SegVirt::None) }
            }

        rule seg_virt() -> SegVirt
            = "virtualize" !ident_char() { SegVirt::Virtualize }
            / "full" !ident_char() { SegVirt::FullNoPredicate }

        rule seg_space() -> SegSpace
            = flat:identifier() _ "(" _ dims:(dim() ** (_ "," _)) _ ")" {
                SegSpace { flat: VName::new(&flat), dims }
            }

        rule dim() -> (VName, SubExp)
            = i:identifier() _ "<" _ d:subexp() { (VName::new(&i), d) }

        rule bin_ops() -> Vec<SegBinOp>
            = "[" _ ops:(bin_op() ** (_ "," _)) _ "]" { ops }

        rule bin_op() -> SegBinOp
            = commutative:("commutative" __)? "op"
                shape:(_ "[" _ s:(subexp() ** (_ "," _)) _ "]" { s })? _
                "(" _ lambda:lambda() _ ";" _ neutral:neutral() _ ")"
            {
                SegBinOp {
                    lambda,
                    neutral,
                    shape: shape.unwrap_or_default(),
                    commutative: commutative.is_some(),
                }
            }

        rule hist_ops() -> Vec<HistOp>
            = "[" _ ops:(hist_op() ** (_ "," _)) _ "]" { ops }

        rule hist_op() -> HistOp
            = "hist" extra:(_ "[" _ s:(subexp() ** (_ "," _)) _ "]" { s })? _
                "(" _ width:subexp() _ ";" _ dests:(identifier() ++ (_ "," _)) _ ";" _
                lambda:lambda() _ ";" _ neutral:neutral() _ ")"
            {
                HistOp {
                    width,
                    extra_shape: extra.unwrap_or_default(),
                    neutral,
                    lambda,
                    dests: dests.iter().map(|d| VName::new(d)).collect(),
                }
            }

        /// `\x: t, y: t -> e` or `\.. -> (e1, e2)`
        pub(crate) rule lambda() -> Lambda
            = begin:position!() "\\" _ params:(param() ** (_ "," _)) _ "->" _
                results:lambda_results() end:position!()
            {
                Lambda { params, results, span: Some(Span::new(begin, end)) }
            }

        rule lambda_results() -> Vec<Exp>
            = "(" _ es:(expression() **<2,> (_ "," _)) _ ")" { es }
            / e:expression() { vec![e] }

        rule param() -> Param
            = name:identifier() _ ":" _ ty:prim_type() { Param { name: VName::new(&name), ty } }

        rule neutral() -> Vec<SubExp>
            = "(" _ ns:(subexp() **<2,> (_ "," _)) _ ")" { ns }
            / n:subexp() { vec![n] }

        rule kernel_body() -> KernelBody
            = "{" _ stms:(body_stm() ** _) _ "return" !ident_char() _
                results:(kernel_result() ** (_ "," _)) _ (";" _)? "}"
            {
                KernelBody { stms, results }
            }

        rule body_stm() -> BodyStm
            = "let" __ pat:pattern() _ "=" _ op:segop() _ ";" {
                BodyStm::Op { pat, op: Box::new(op) }
            }
            / "let" __ name:identifier() _ ":" _ ty:prim_type() _ "=" _ array:identifier() _
                "[" _ index:(expression() ** (_ "," _)) _ "]" _ ";"
            {
                BodyStm::Index { name: VName::new(&name), ty, array: VName::new(&array), index }
            }
            / "let" __ name:identifier() _ ":" _ "[" _ len:$(['0'..='9']+) _ "]" _
                ty:prim_type() _ "=" _ "[" _ elems:(subexp() ** (_ "," _)) _ "]" _ ";"
            {?
                match len.parse::<usize>() {
                    Ok(n) if n == elems.len() => {
                        Ok(BodyStm::ArrayLit { name: VName::new(&name), ty, elems })
                    }
                    _ => Err("array literal of the declared length"),
                }
            }
            / "let" __ name:identifier() _ ":" _ ty:prim_type() _ "=" _ exp:expression() _ ";" {
                BodyStm::Let { name: VName::new(&name), ty, exp }
            }

        rule kernel_result() -> KernelResult
            = "tile" _ "(" _ tiles:(tile() ** (_ "," _)) _ ";" _ array:identifier() _ ")" {
                KernelResult::TileReturns { tiles, array: VName::new(&array) }
            }
            / "write" _ "[" _ shape:(subexp() ** (_ "," _)) _ "]" _
                "(" _ writes:(write_target() ** (_ "," _)) _ ")"
            {
                KernelResult::WriteReturns { shape, writes }
            }
            / "concat" _ "(" _ split:split() _ "," _ per_thread:subexp() _ ";" _
                array:identifier() _ ")"
            {
                KernelResult::ConcatReturns { split, per_thread, array: VName::new(&array) }
            }
            / se:subexp() { KernelResult::Returns(se) }

        rule tile() -> (SubExp, SubExp)
            = extent:subexp() _ "/" _ size:subexp() { (extent, size) }

        rule write_target() -> (Vec<SubExp>, SubExp)
            = "[" _ is:(subexp() ** (_ "," _)) _ "]" _ "=" _ v:subexp() { (is, v) }

        rule split() -> Split
            = "contiguous" !ident_char() { Split::Contiguous }
            / "strided" _ "(" _ s:subexp() _ ")" { Split::Strided(s) }

        /// Scalar expressions, loosest binding first
        pub(crate) rule expression() -> Exp = precedence!{
            x:(@) _ "||" _ y:@ { helpers::make_binary(BinOp::LogOr, x, y) }
            --
            x:(@) _ "&&" _ y:@ { helpers::make_binary(BinOp::LogAnd, x, y) }
            --
            x:(@) _ "==" _ y:@ { helpers::make_cmp(CmpOp::Eq, x, y) }
            x:(@) _ "!=" _ y:@ { helpers::make_cmp(CmpOp::Ne, x, y) }
            x:(@) _ "<=" _ y:@ { helpers::make_cmp(CmpOp::Le, x, y) }
            x:(@) _ ">=" _ y:@ { helpers::make_cmp(CmpOp::Ge, x, y) }
            x:(@) _ "<" !"<" _ y:@ { helpers::make_cmp(CmpOp::Lt, x, y) }
            x:(@) _ ">" !">" _ y:@ { helpers::make_cmp(CmpOp::Gt, x, y) }
            --
            x:(@) _ "|" !"|" _ y:@ { helpers::make_binary(BinOp::Or, x, y) }
            x:(@) _ "^" _ y:@ { helpers::make_binary(BinOp::Xor, x, y) }
            --
            x:(@) _ "&" !"&" _ y:@ { helpers::make_binary(BinOp::And, x, y) }
            --
            x:(@) _ "<<" _ y:@ { helpers::make_binary(BinOp::Shl, x, y) }
            x:(@) _ ">>" _ y:@ { helpers::make_binary(BinOp::Shr, x, y) }
            --
            x:(@) _ "+" _ y:@ { helpers::make_binary(BinOp::Add, x, y) }
            x:(@) _ "-" _ y:@ { helpers::make_binary(BinOp::Sub, x, y) }
            --
            x:(@) _ "*" _ y:@ { helpers::make_binary(BinOp::Mul, x, y) }
            x:(@) _ "/" _ y:@ { helpers::make_binary(BinOp::Div, x, y) }
            x:(@) _ "%" _ y:@ { helpers::make_binary(BinOp::Mod, x, y) }
            --
            "-" _ x:@ { helpers::make_unary(UnOp::Neg, x) }
            "!" _ x:@ { helpers::make_unary(UnOp::Not, x) }
            --
            "(" _ e:expression() _ ")" { e }
            "min" _ "(" _ x:expression() _ "," _ y:expression() _ ")" {
                helpers::make_binary(BinOp::Min, x, y)
            }
            "max" _ "(" _ x:expression() _ "," _ y:expression() _ ")" {
                helpers::make_binary(BinOp::Max, x, y)
            }
            "abs" _ "(" _ x:expression() _ ")" { helpers::make_unary(UnOp::Abs, x) }
            "select" _ "(" _ c:expression() _ "," _ t:expression() _ "," _ e:expression() _ ")" {
                Exp::Select(Box::new(c), Box::new(t), Box::new(e))
            }
            "bitcast" _ "<" _ ty:prim_type() _ ">" _ "(" _ x:expression() _ ")" {
                Exp::BitCast(ty, Box::new(x))
            }
            ty:prim_type() _ "(" _ x:expression() _ ")" { Exp::Convert(ty, Box::new(x)) }
            v:literal() { Exp::Const(v) }
            name:identifier() { Exp::Var(VName::new(&name)) }
        }

        pub(crate) rule subexp() -> SubExp
            = v:literal() { SubExp::Const(v) }
            / name:identifier() { SubExp::Var(VName::new(&name)) }

        pub(crate) rule prim_type() -> PrimType
            = t:(
                "bool" { PrimType::Bool }
                / "i32" { PrimType::I32 }
                / "i64" { PrimType::I64 }
                / "u32" { PrimType::U32 }
                / "u64" { PrimType::U64 }
                / "f32" { PrimType::F32 }
                / "f64" { PrimType::F64 }
            ) !ident_char() { t }

        /// Literal may be a Boolean or a number with an optional type suffix
        pub(crate) rule literal() -> PrimValue
            = "true" !ident_char() { PrimValue::Bool(true) }
            / "false" !ident_char() { PrimValue::Bool(false) }
            / l:number() {? helpers::parse_literal(l, None) }

        rule typed_literal(ty: PrimType) -> PrimValue
            = b:$("true" / "false") !ident_char() {?
                match ty {
                    PrimType::Bool => Ok(PrimValue::Bool(b == "true")),
                    _ => Err("literal of the declared type"),
                }
            }
            / l:number() {? helpers::parse_literal(l, Some(ty)) }

        rule number() -> &'input str
            = n:quiet!{$("-"? ['0'..='9']+ ("." ['0'..='9']+)? (['i'|'u'|'f'] ("32" / "64"))?)}
                !ident_char() { n }
            / expected!("number")

        rule identifier() -> String
            = s:ident_text() { s.to_string() }

        rule ident_text() -> &'input str
            = quiet!{$(!keyword() ['a'..='z'|'A'..='Z'|'_'] ident_char()*)}
            / expected!("identifier")

        rule ident_char() = ['a'..='z'|'A'..='Z'|'0'..='9'|'_']

        rule keyword() -> ()
            = ("array" / "scalar" / "const" / "let" / "return"
                / "segmap" / "segred" / "segscan" / "seghist" / "thread" / "group"
                / "virtualize" / "full" / "commutative" / "op" / "hist"
                / "tile" / "write" / "concat" / "contiguous" / "strided"
                / "replicate" / "iota" / "copy"
                / "min" / "max" / "abs" / "select" / "bitcast" / "true" / "false"
                / "bool" / "i32" / "i64" / "u32" / "u64" / "f32" / "f64")
                !ident_char()

        /// Potential whitespace
        rule _() -> ()
            = quiet!{(
                [' '|'\n'|'\t'|'\r'] _) // 0 or more whitespaces
                / ("//" (!['\n'][_])* _) // Comment to EOL
                / ("/*" (!"*/"[_])* "*/" _) // Block comment
                / ""}

        /// At least one whitespace
        rule __() -> ()
            = quiet!{[' '|'\n'|'\t'|'\r'] _}
    }
}

/// Parses a descriptor text without rendering errors.
pub fn parse_str(src: &str) -> Result<Module, ParseError<LineCol>> {
    descriptor::module(src)
}

/// Parses a descriptor file, reporting the first syntax error against the source.
pub fn parse(source: &SourceCode) -> Result<Module, ErrorReported> {
    parse_str(source.str()).map_err(|err| emit_parse_error(source, &err))
}

fn emit_parse_error(source: &SourceCode, err: &ParseError<LineCol>) -> ErrorReported {
    let label = format!("expected {}", err.expected);
    let column = err.location.column.saturating_sub(1);
    let at = Location {
        line: err.location.line,
        begin: column,
        end: column + 1,
    };
    Diagnostic::new(label)
        .at(at, "unexpected input")
        .emit(Some(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl;

    fn var(n: &str) -> Exp {
        Exp::Var(VName::new(n))
    }

    #[test]
    fn literals() {
        assert_eq!(descriptor::literal("42"), Ok(PrimValue::I64(42)), "cannot parse 42");
        assert_eq!(descriptor::literal("-1i32"), Ok(PrimValue::I32(-1)), "cannot parse -1i32");
        assert_eq!(descriptor::literal("7u64"), Ok(PrimValue::U64(7)), "cannot parse 7u64");
        assert_eq!(descriptor::literal("0.5f32"), Ok(PrimValue::F32(0.5)));
        assert_eq!(descriptor::literal("2.0"), Ok(PrimValue::F64(2.0)));
        assert_eq!(descriptor::literal("true"), Ok(PrimValue::Bool(true)));
        assert!(descriptor::literal("1.5i32").is_err(), "fractional integer accepted");
        assert!(descriptor::literal("3000000000i32").is_err(), "overflow not handled");
        assert!(descriptor::literal("3abc").is_err(), "garbage not handled");
        assert!(descriptor::literal("").is_err(), "matches empty");
    }

    #[test]
    fn prim_types() {
        assert_eq!(descriptor::prim_type("i64"), Ok(PrimType::I64));
        assert_eq!(descriptor::prim_type("f32"), Ok(PrimType::F32));
        assert!(descriptor::prim_type("i64x").is_err(), "type prefix accepted");
    }

    #[test]
    fn expression_precedence() {
        let e = descriptor::expression("a + b * 2").unwrap();
        let expected = helpers::make_binary(
            BinOp::Add,
            var("a"),
            helpers::make_binary(BinOp::Mul, var("b"), Exp::int(2)),
        );
        assert_eq!(e, expected, "multiplication does not bind tighter than addition");

        let e = descriptor::expression("i < n && i % 2 == 0").unwrap();
        let expected = helpers::make_binary(
            BinOp::LogAnd,
            helpers::make_cmp(CmpOp::Lt, var("i"), var("n")),
            helpers::make_cmp(
                CmpOp::Eq,
                helpers::make_binary(BinOp::Mod, var("i"), Exp::int(2)),
                Exp::int(0),
            ),
        );
        assert_eq!(e, expected);
    }

    #[test]
    fn shifts_and_comparisons_do_not_collide() {
        let e = descriptor::expression("x << 2 <= y").unwrap();
        let expected = helpers::make_cmp(
            CmpOp::Le,
            helpers::make_binary(BinOp::Shl, var("x"), Exp::int(2)),
            var("y"),
        );
        assert_eq!(e, expected);
    }

    #[test]
    fn builtin_functions() {
        assert_eq!(
            descriptor::expression("i64(x)"),
            Ok(Exp::Convert(PrimType::I64, Box::new(var("x"))))
        );
        assert_eq!(
            descriptor::expression("bitcast<i32>(f)"),
            Ok(Exp::BitCast(PrimType::I32, Box::new(var("f"))))
        );
        assert_eq!(
            descriptor::expression("min(a, b)"),
            Ok(helpers::make_binary(BinOp::Min, var("a"), var("b")))
        );
        assert_eq!(
            descriptor::expression("minimum"),
            Ok(var("minimum")),
            "keyword prefix not accepted as identifier"
        );
    }

    #[test]
    fn lambdas() {
        let lam = descriptor::lambda(r"\x: i32, y: i32 -> x + y").unwrap();
        assert_eq!(lam, dsl::binop_lambda(BinOp::Add, PrimType::I32));
        assert!(lam.span.is_some(), "lambda has no span");

        let lam = descriptor::lambda(r"\a: f32, b: i32, x: f32, y: i32 -> (a + x, max(b, y))")
            .unwrap();
        assert_eq!(lam.arity(), 2);
        assert!(lam.is_well_formed());
    }

    #[test]
    fn thread_level_reduction() {
        let src = r"
            scalar n: i64;
            array xs: [n]i32;
            // one partial sum
            let total: [1]i32 = segred@thread(4, 64) flat(i < n)
                [commutative op(\x: i32, y: i32 -> x + y; 0i32)] {
              let x: i32 = xs[i];
              return x
            };
        ";
        let module = parse_str(src).unwrap();
        assert_eq!(module.env.scalars.get(&VName::new("n")), Some(&PrimType::I64));
        assert_eq!(
            module.env.arrays.get(&VName::new("total")),
            Some(&(PrimType::I32, vec![SubExp::int(1)])),
            "destination was not declared"
        );
        let expected = dsl::segred(
            dsl::thread(dsl::size(4), dsl::size(64), SegVirt::None),
            dsl::space("flat", vec![("i", dsl::size_var("n"))]),
            vec![dsl::seg_binop(
                dsl::binop_lambda(BinOp::Add, PrimType::I32),
                vec![dsl::lit_i32(0)],
                true,
            )],
            dsl::body(
                vec![dsl::index("x", PrimType::I32, "xs", vec![dsl::var("i")])],
                vec![dsl::returns(dsl::size_var("x"))],
            ),
        );
        match &module.ops[..] {
            [HostOp::Seg { pat, op }] => {
                assert_eq!(pat, &vec![dsl::pat_elem("total", PrimType::I32, vec![dsl::size(1)])]);
                assert!(op.span.is_some(), "operation has no span");
                assert_eq!(
                    SegOp {
                        span: None,
                        ..op.clone()
                    },
                    expected
                );
            }
            ops => panic!("unexpected operations {:?}", ops),
        }
    }

    #[test]
    fn nested_operations_and_results() {
        let src = r"
            const m: i64 = 8;
            array xs: [m][16]f32;
            let out: [m][16]f32 = segmap@group(m, 16) g(gi < m) {
              let s: [16]f32 = segscan@thread virtualize l(li < 16)
                  [op(\x: f32, y: f32 -> x + y; 0f32)] {
                let v: f32 = xs[gi, li];
                return v
              };
              return s
            };
            counts = replicate(0i64);
        ";
        let module = parse_str(src).unwrap();
        assert_eq!(module.env.constants.get(&VName::new("m")), Some(&PrimValue::I64(8)));
        let op = match &module.ops[0] {
            HostOp::Seg { op, .. } => op,
            other => panic!("unexpected operation {:?}", other),
        };
        assert_eq!(op.level.level, Level::Group);
        match &op.body.stms[..] {
            [BodyStm::Op { pat, op: inner }] => {
                assert_eq!(pat[0].shape, vec![dsl::size(16)]);
                assert_eq!(inner.level.virt, SegVirt::Virtualize);
                assert!(matches!(inner.kind, SegOpKind::Scan(_)));
            }
            stms => panic!("unexpected body {:?}", stms),
        }
        assert_eq!(
            module.ops[1],
            HostOp::Replicate {
                dest: VName::new("counts"),
                value: SubExp::int(0)
            }
        );
    }

    #[test]
    fn special_results() {
        let r = descriptor::segop(
            "segmap@thread(1, 32) f(i < n) { return write[n]([j] = v), concat(strided(s), 4; c) }",
        )
        .unwrap();
        assert_eq!(
            r.body.results,
            vec![
                KernelResult::WriteReturns {
                    shape: vec![SubExp::var("n")],
                    writes: vec![(vec![SubExp::var("j")], SubExp::var("v"))],
                },
                KernelResult::ConcatReturns {
                    split: Split::Strided(SubExp::var("s")),
                    per_thread: SubExp::int(4),
                    array: VName::new("c"),
                },
            ]
        );
    }

    #[test]
    fn errors_are_located() {
        let err = parse_str("array xs: [n]i32\nscalar n: i64;").unwrap_err();
        assert_eq!(err.location.line, 2, "error reported on the wrong line");
        assert!(parse_str("let x: i32 = segmap@warp f(i < 2) { return i };").is_err());
        assert!(parse_str("const k: i32 = 1.5;").is_err(), "fractional i32 constant accepted");
    }
}
