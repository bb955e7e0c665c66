//! Line-oriented command driver for the client role.
//!
//! One command per line; `#` starts a comment. Functions are referred
//! to by name, with `!name` for the negation of a binding. This covers
//! the operations the engine exposes; an interactive console is a
//! separate front end and not part of the core.

use anyhow::{anyhow, bail, Result};

use nimbus_bdd::refs::Ref;

use crate::session::{ClientError, Session};

/// Execute every command in `text`. Stops at the first failure; a kill
/// arriving mid-script ends the run cleanly.
pub async fn run_script(session: &mut Session, text: &str) -> Result<()> {
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(line, "command");
        match run_command(session, line).await {
            Ok(()) => {}
            Err(CommandFailure::Killed) => {
                tracing::info!("kill received, ending script");
                return Ok(());
            }
            Err(CommandFailure::Failed(e)) => {
                return Err(e.context(format!("line {}: {raw}", lineno + 1)));
            }
        }
        match session.pump_control().await {
            Ok(()) => {}
            Err(ClientError::Killed) => {
                tracing::info!("kill received, ending script");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

enum CommandFailure {
    Killed,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for CommandFailure {
    fn from(e: anyhow::Error) -> Self {
        CommandFailure::Failed(e)
    }
}

impl From<ClientError> for CommandFailure {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Killed => CommandFailure::Killed,
            other => CommandFailure::Failed(other.into()),
        }
    }
}

fn lookup(session: &Session, name: &str) -> Result<Ref> {
    session
        .roots
        .get(name)
        .ok_or_else(|| anyhow!("function '{name}' undefined"))
}

fn lookup_all(session: &Session, names: &[&str]) -> Result<Vec<Ref>> {
    names.iter().map(|n| lookup(session, n)).collect()
}

fn lookup_variable(session: &Session, name: &str) -> Result<Ref> {
    let r = lookup(session, name)?;
    if !r.absval().is_var() {
        bail!("'{name}' is not a variable");
    }
    Ok(r)
}

#[derive(Clone, Copy)]
enum ReduceOp {
    And,
    Or,
    Xor,
}

/// Linear left-to-right reduction over named arguments.
async fn reduce(
    session: &mut Session,
    unit: Ref,
    args: &[&str],
    op: ReduceOp,
) -> Result<Ref, CommandFailure> {
    let mut val = unit;
    let mut first = true;
    for name in args {
        let arg = lookup(session, name)?;
        val = if first {
            arg
        } else {
            match op {
                ReduceOp::And => session.and(val, arg).await?,
                ReduceOp::Or => session.or(val, arg).await?,
                ReduceOp::Xor => session.xor(val, arg).await?,
            }
        };
        first = false;
    }
    Ok(val)
}

async fn run_command(session: &mut Session, line: &str) -> Result<(), CommandFailure> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((cmd, args)) = parts.split_first() else {
        return Ok(());
    };
    match *cmd {
        "var" => {
            for name in args {
                let r = session.var().await?;
                session.roots.assign(name, r, true);
                println!("VAR {name} = {r}");
            }
        }
        "and" | "or" | "xor" => {
            let (dest, rest) = args
                .split_first()
                .ok_or_else(|| anyhow!("need destination name"))?;
            let (unit, op) = match *cmd {
                "and" => (Ref::ONE, ReduceOp::And),
                "or" => (Ref::ZERO, ReduceOp::Or),
                _ => (Ref::ZERO, ReduceOp::Xor),
            };
            let val = reduce(session, unit, rest, op).await?;
            session.roots.assign(dest, val, false);
            println!("RESULT {dest} = {val}");
        }
        "not" => {
            let [dest, f] = args else {
                return Err(anyhow!("not requires 2 arguments").into());
            };
            let r = lookup(session, f)?.negate();
            session.roots.assign(dest, r, false);
            println!("RESULT {dest} = {r}");
        }
        "ite" => {
            let [dest, fi, ft, fe] = args else {
                return Err(anyhow!("ite requires 4 arguments").into());
            };
            let (i, t, e) = (
                lookup(session, fi)?,
                lookup(session, ft)?,
                lookup(session, fe)?,
            );
            let r = session.ite(i, t, e).await?;
            session.roots.assign(dest, r, false);
            println!("RESULT {dest} = {r}");
        }
        "restrict" => {
            let (dest, rest) = args
                .split_first()
                .ok_or_else(|| anyhow!("need destination name"))?;
            let (f, lits) = rest
                .split_first()
                .ok_or_else(|| anyhow!("need function name"))?;
            let f = lookup(session, f)?;
            let lits = lookup_all(session, lits)?;
            let r = session.restrict(f, &lits).await?;
            session.roots.assign(dest, r, false);
            println!("RESULT {dest} = {r}");
        }
        "equant" | "uquant" => {
            let (dest, rest) = args
                .split_first()
                .ok_or_else(|| anyhow!("need destination name"))?;
            let (f, vars) = rest
                .split_first()
                .ok_or_else(|| anyhow!("need function name"))?;
            let f = lookup(session, f)?;
            let vars: Vec<Ref> = vars
                .iter()
                .map(|v| lookup_variable(session, v))
                .collect::<Result<_>>()?;
            let r = if *cmd == "equant" {
                session.equant(f, &vars).await?
            } else {
                session.uquant(f, &vars).await?
            };
            session.roots.assign(dest, r, false);
            println!("RESULT {dest} = {r}");
        }
        "shift" => {
            let (dest, rest) = args
                .split_first()
                .ok_or_else(|| anyhow!("need destination name"))?;
            let (f, pairs) = rest
                .split_first()
                .ok_or_else(|| anyhow!("need function name"))?;
            if pairs.is_empty() || pairs.len() % 2 != 0 {
                return Err(anyhow!("shift takes new/old variable pairs").into());
            }
            let f = lookup(session, f)?;
            let mut vmap = Vec::new();
            for pair in pairs.chunks_exact(2) {
                let vnew = lookup_variable(session, pair[0])?;
                let vold = lookup_variable(session, pair[1])?;
                vmap.push((vold, vnew));
            }
            let r = session.shift(f, &vmap).await?;
            session.roots.assign(dest, r, false);
            println!("RESULT {dest} = {r}");
        }
        "conjunct" => {
            let (dest, rest) = args
                .split_first()
                .ok_or_else(|| anyhow!("need destination name"))?;
            let refs = lookup_all(session, rest)?;
            let out = session.conjunct(refs).await?;
            session.roots.assign(dest, out.result, false);
            println!(
                "CONJUNCT {dest} = {}: {} arguments, {} aborts, size {}",
                out.result, out.arguments, out.aborts, out.result_size
            );
        }
        "count" => {
            for name in args {
                let f = lookup(session, name)?;
                let n = session.count(f).await?;
                println!("{name}: {n}");
            }
        }
        "support" => {
            let refs = lookup_all(session, args)?;
            let support = session.support(&refs).await?;
            let mut vars: Vec<Ref> = support.into_iter().collect();
            vars.sort();
            let names: Vec<String> = vars
                .iter()
                .map(|v| {
                    session
                        .roots
                        .variable_name(*v)
                        .map(str::to_string)
                        .unwrap_or_else(|| v.to_string())
                })
                .collect();
            println!("support: {}", names.join(" "));
        }
        "size" => {
            for name in args {
                let f = lookup(session, name)?;
                let n = session.size(f).await?;
                println!("{name}: {n} nodes");
            }
        }
        "equal" => {
            let [a, b] = args else {
                return Err(anyhow!("equal requires two arguments").into());
            };
            let (ra, rb) = (lookup(session, a)?, lookup(session, b)?);
            println!("{}", if ra == rb { "equal" } else { "not equal" });
        }
        "delete" => {
            for name in args {
                if !session.roots.delete(name) {
                    return Err(anyhow!("function '{name}' not found").into());
                }
            }
        }
        "collect" => {
            session.collect().await?;
            println!("collected");
        }
        "flush" => {
            session.flush().await?;
            println!("flushed");
        }
        "status" => {
            match &session.last_summary {
                Some(words) => println!("status: {} summary words", words.len()),
                None => println!("status: no statistics gathered yet (run flush)"),
            }
        }
        "kill" => {
            session.kill().await?;
            println!("killed");
        }
        other => {
            return Err(anyhow!("unknown command '{other}'").into());
        }
    }
    Ok(())
}
