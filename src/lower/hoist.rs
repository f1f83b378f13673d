//! Local memory is allocated once per kernel launch, so every local array declaration is moved
//! to the front of the body.

use super::error::{LowerError, LowerResult};
use crate::ir::free_vars::{declared_names, exp_vars};
use crate::ir::{Space, Stmt};

fn extract(stmt: Stmt, hoisted: &mut Vec<Stmt>) -> Stmt {
    match stmt {
        Stmt::DeclareArray {
            space: Space::Local,
            ..
        } => {
            hoisted.push(stmt);
            Stmt::Skip
        }
        Stmt::Seq(stmts) => Stmt::seq(stmts.into_iter().map(|s| extract(s, hoisted)).collect()),
        Stmt::Comment(text, body) => Stmt::Comment(text, Box::new(extract(*body, hoisted))),
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => Stmt::If {
            cond,
            then_branch: Box::new(extract(*then_branch, hoisted)),
            else_branch: Box::new(extract(*else_branch, hoisted)),
        },
        Stmt::For { iter, bound, body } => Stmt::For {
            iter,
            bound,
            body: Box::new(extract(*body, hoisted)),
        },
        Stmt::While { cond, body } => Stmt::While {
            cond,
            body: Box::new(extract(*body, hoisted)),
        },
        other => other,
    }
}

pub(crate) fn hoist_local_arrays(body: Stmt, kernel: &str) -> LowerResult<Stmt> {
    let mut hoisted = vec![];
    let rest = extract(body, &mut hoisted);
    let declared = declared_names(&rest);
    for decl in &hoisted {
        if let Stmt::DeclareArray { name, len, .. } = decl {
            if let Some(v) = exp_vars(len).into_iter().find(|v| declared.contains(v)) {
                return Err(LowerError::limitation(
                    format!(
                        "local array `{}` of kernel {} has a size depending on `{}`, which is \
                         only known inside the kernel",
                        name, kernel, v
                    ),
                    None,
                ));
            }
        }
    }
    hoisted.push(rest);
    Ok(Stmt::seq(hoisted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Exp, PrimType, VName};

    #[test]
    fn local_arrays_move_to_the_front() {
        let arr = VName::new("red_arr");
        let i = VName::new("i");
        let body = Stmt::seq(vec![
            Stmt::declare(&i, PrimType::I64),
            Stmt::for_loop(
                &VName::new("k"),
                Exp::int(4),
                Stmt::declare_array(&arr, PrimType::I32, Exp::int(256), Space::Local),
            ),
        ]);
        let hoisted = hoist_local_arrays(body, "segred").unwrap();
        match hoisted {
            Stmt::Seq(stmts) => assert_eq!(
                stmts[0],
                Stmt::declare_array(&arr, PrimType::I32, Exp::int(256), Space::Local),
                "the local array was not hoisted first"
            ),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn private_arrays_stay_in_place() {
        let arr = VName::new("elems");
        let decl = Stmt::declare_array(&arr, PrimType::I32, Exp::int(3), Space::Private);
        let body = Stmt::when(Exp::var(&VName::new("c")), decl.clone());
        assert_eq!(hoist_local_arrays(body.clone(), "segmap").unwrap(), body);
    }

    #[test]
    fn sizes_known_only_inside_the_kernel_are_rejected() {
        let n = VName::new("n_inner");
        let body = Stmt::seq(vec![
            Stmt::declare_init(&n, PrimType::I64, Exp::int(7)),
            Stmt::declare_array(&VName::new("arr"), PrimType::I32, Exp::var(&n), Space::Local),
        ]);
        let err = hoist_local_arrays(body, "segmap").unwrap_err();
        assert!(err.is_limitation(), "expected a limitation, got {}", err);
    }
}
