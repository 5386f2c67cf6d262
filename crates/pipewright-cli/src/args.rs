//! Command-line parsing.
//!
//! ```text
//! pipewright [OPTIONS] -- STAGE [| STAGE ...]
//! ```
//!
//! Stages are separated by a literal `|` argument (quote it in the calling
//! shell). A stage whose first word starts with `@` names an in-process
//! function instead of a host command.

use std::path::PathBuf;

use pipewright_types::StatusMatch;

/// What the user asked for.
#[derive(Debug, PartialEq)]
pub enum Command {
    Run(Invocation),
    Help,
    Version,
}

/// One pipeline run.
#[derive(Debug, Default, PartialEq)]
pub struct Invocation {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub append: bool,
    /// `(stage index, status)`; indexes start at 1 on the command line and
    /// are stored 0-based.
    pub catches: Vec<(usize, StatusMatch)>,
    pub json: bool,
    pub grace_ms: Option<u64>,
    pub stages: Vec<Vec<String>>,
}

/// Split `words` on literal `|`.
fn split_stages(words: &[String]) -> Result<Vec<Vec<String>>, String> {
    let stages: Vec<Vec<String>> = words
        .split(|w| w == "|")
        .map(<[String]>::to_vec)
        .collect();
    if stages.iter().any(Vec::is_empty) {
        return Err("empty pipeline stage".to_string());
    }
    Ok(stages)
}

fn parse_status(text: &str) -> Result<StatusMatch, String> {
    let number = |s: &str| {
        s.parse::<i32>()
            .map_err(|_| format!("invalid exit status: {s}"))
    };
    match text.split_once('-') {
        Some((lo, hi)) if !lo.is_empty() => Ok(StatusMatch::from(number(lo)?..=number(hi)?)),
        _ => Ok(StatusMatch::from(number(text)?)),
    }
}

/// `STAGE:CODE`, where CODE is a status or an inclusive `LO-HI` range.
fn parse_catch(spec: &str) -> Result<(usize, StatusMatch), String> {
    let (stage, code) = spec
        .split_once(':')
        .ok_or_else(|| format!("--catch expects STAGE:CODE, got {spec}"))?;
    let stage: usize = stage
        .parse()
        .map_err(|_| format!("invalid stage number: {stage}"))?;
    if stage == 0 {
        return Err("stage numbers start at 1".to_string());
    }
    Ok((stage - 1, parse_status(code)?))
}

/// Value of `--name=value` or `--name value`.
fn option_value(
    arg: &str,
    name: &str,
    rest: &mut std::slice::Iter<'_, String>,
) -> Result<Option<String>, String> {
    if arg == name {
        return rest
            .next()
            .cloned()
            .map(Some)
            .ok_or_else(|| format!("{name} requires a value"));
    }
    Ok(arg
        .strip_prefix(name)
        .and_then(|tail| tail.strip_prefix('='))
        .map(str::to_string))
}

/// Parse arguments (without the program name).
pub fn parse(args: &[String]) -> Result<Command, String> {
    let mut invocation = Invocation::default();
    let mut rest = args.iter();

    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "--append" => invocation.append = true,
            "--json" => invocation.json = true,
            "--" => {
                let words: Vec<String> = rest.cloned().collect();
                invocation.stages = split_stages(&words)?;
                break;
            }
            a if a.starts_with("--stdin") => {
                if let Some(path) = option_value(a, "--stdin", &mut rest)? {
                    invocation.stdin = Some(PathBuf::from(path));
                } else {
                    return Err(format!("unknown option: {a}"));
                }
            }
            a if a.starts_with("--stdout") => {
                if let Some(path) = option_value(a, "--stdout", &mut rest)? {
                    invocation.stdout = Some(PathBuf::from(path));
                } else {
                    return Err(format!("unknown option: {a}"));
                }
            }
            a if a.starts_with("--catch") => match option_value(a, "--catch", &mut rest)? {
                Some(spec) => invocation.catches.push(parse_catch(&spec)?),
                None => return Err(format!("unknown option: {a}")),
            },
            a if a.starts_with("--grace") => match option_value(a, "--grace", &mut rest)? {
                Some(ms) => {
                    let ms = ms
                        .parse()
                        .map_err(|_| format!("invalid grace period: {ms}"))?;
                    invocation.grace_ms = Some(ms);
                }
                None => return Err(format!("unknown option: {a}")),
            },
            a if a.starts_with('-') => return Err(format!("unknown option: {a}")),
            _ => {
                // First stage word without a `--`.
                let mut words = vec![arg.clone()];
                words.extend(rest.cloned());
                invocation.stages = split_stages(&words)?;
                break;
            }
        }
    }

    if invocation.stages.is_empty() {
        return Err("no pipeline given".to_string());
    }
    if invocation.append && invocation.stdout.is_none() {
        return Err("--append requires --stdout".to_string());
    }
    if let Some((stage, _)) = invocation
        .catches
        .iter()
        .find(|(stage, _)| *stage >= invocation.stages.len())
    {
        return Err(format!("--catch names stage {} but the pipeline has {}", stage + 1, invocation.stages.len()));
    }
    Ok(Command::Run(invocation))
}
