use super::{
    colorize_outcome, core_error, json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_SUCCESS,
};
use std::path::PathBuf;
use strata_core::{
    BuildOptions, BuildReport, Builder, LayerOutcome, LayerType, OnRunFailure, RunnerKind,
};
use strata_schema::Substitutions;

#[derive(Debug, Clone, Default)]
pub struct Flags {
    pub no_cache: bool,
    pub layer_type: Option<String>,
    pub runner: Option<String>,
    pub consider_timestamps: bool,
    pub on_run_failure: String,
    pub leave_unladen: bool,
    pub substitutions: Vec<String>,
}

fn options(ctx: &mut Context, flags: &Flags) -> Result<BuildOptions, String> {
    if let Some(runner) = &flags.runner {
        ctx.config.runner = runner.parse::<RunnerKind>().map_err(|e| e.to_string())?;
    }
    let layer_type = match &flags.layer_type {
        Some(name) => name.parse::<LayerType>().map_err(|e| e.to_string())?,
        None => ctx.config.layer_type,
    };
    let on_run_failure = flags
        .on_run_failure
        .parse::<OnRunFailure>()
        .map_err(|e| e.to_string())?;
    let substitutions = Substitutions::parse(&flags.substitutions)
        .map_err(|e| format!("recipe error: {e}"))?;

    Ok(BuildOptions {
        no_cache: flags.no_cache,
        layer_type,
        consider_timestamps: flags.consider_timestamps || ctx.config.consider_timestamps,
        on_run_failure,
        order_only: false,
        leave_unladen: flags.leave_unladen,
        substitutions,
    })
}

fn summary(report: &BuildReport) -> String {
    format!(
        "{} built, {} build-only, {} cached",
        report.count(LayerOutcome::Built),
        report.count(LayerOutcome::BuildOnly),
        report.count(LayerOutcome::Cached)
    )
}

pub fn run(mut ctx: Context, files: &[PathBuf], flags: &Flags) -> Result<u8, String> {
    let options = options(&mut ctx, flags)?;
    let _lock = ctx.lock()?;
    let mut builder = Builder::new(&ctx.config, options).map_err(|e| core_error(&e))?;

    let pb = if ctx.json {
        None
    } else {
        Some(spinner("building layers..."))
    };
    let report = match builder.build_multiple(files) {
        Ok(r) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, &summary(&r));
            }
            r
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(core_error(&e));
        }
    };

    if ctx.json {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }
    for file in &report.files {
        println!("{}", file.path.display());
        for layer in &file.layers {
            let image = layer
                .manifest
                .as_ref()
                .map_or_else(|| "-".to_owned(), |m| m.digest.short().to_owned());
            println!(
                "  {:<20} {:<12} {image}",
                layer.layer,
                colorize_outcome(&layer.outcome.to_string())
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context {
            config: strata_core::StrataConfig::default(),
            json: true,
        }
    }

    #[test]
    fn flags_override_config() {
        let mut ctx = ctx();
        let flags = Flags {
            layer_type: Some("squashfs".to_owned()),
            runner: Some("chroot".to_owned()),
            on_run_failure: "continue".to_owned(),
            substitutions: vec!["A=1".to_owned()],
            ..Flags::default()
        };
        let opts = options(&mut ctx, &flags).unwrap();
        assert_eq!(opts.layer_type, LayerType::Squashfs);
        assert_eq!(opts.on_run_failure, OnRunFailure::Continue);
        assert_eq!(ctx.config.runner, RunnerKind::Chroot);
    }

    #[test]
    fn bad_flags_are_errors() {
        let flags = Flags {
            on_run_failure: "abort".to_owned(),
            layer_type: Some("zip".to_owned()),
            ..Flags::default()
        };
        assert!(options(&mut ctx(), &flags)
            .unwrap_err()
            .starts_with("configuration error:"));

        let flags = Flags {
            on_run_failure: "abort".to_owned(),
            substitutions: vec!["novalue".to_owned()],
            ..Flags::default()
        };
        assert!(options(&mut ctx(), &flags)
            .unwrap_err()
            .starts_with("recipe error:"));
    }
}
