use anyhow::{bail, Result};
use cmr::pipe::{parse_pipeline, CancelToken, Supervisor};
use tracing::debug;

const USAGE: &str = "usage: cmr-pipe [--CMR_PIPE_UID <uid>] [--CMR_PIPE_GID <gid>] \
[--CMR_NAME <name>] [--CMR_PIPE_OUT <path>] [--CMR_PIPE_ERR <path>] <command> [args...] [: <stage> ...]";

fn args() -> Result<Vec<String>> {
    let mut args = Vec::new();
    for arg in std::env::args_os().skip(1) {
        match arg.into_string() {
            Ok(arg) => args.push(arg),
            Err(arg) => bail!("argument {:?} is not valid UTF-8", arg),
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    // child stderr is echoed on our stderr, keep log lines to warnings
    cmr::logging::init("warn");

    let spec = match args().and_then(parse_pipeline) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("cmr-pipe: {:#}\n{}", e, USAGE);
            std::process::exit(1);
        }
    };
    debug!(stages = spec.stages.len(), uid = ?spec.uid, gid = ?spec.gid, "parsed pipeline");

    let cancel = CancelToken::from_signals()?;
    let outcome = Supervisor::new(spec).cancel_token(cancel).run()?;
    std::process::exit(outcome.exit_code());
}
