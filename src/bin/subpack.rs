use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use subpack::core::config::parse_config;
use subpack::{ApkReverseEngineer, Job, Outcome, PipelineConfig, SigningCredentials};

const USAGE: &str = "Usage:
  subpack info <apk>
  subpack repack <apk> --out PATH [--package NAME] [--name NAME] [--icon PATH]
                 [--keystore PATH --store-pass PASS --alias ALIAS [--key-pass PASS]]
  subpack verify <apk>
  subpack cleanup
Every command accepts [--config PATH].";

#[derive(Default)]
struct Args {
    command: String,
    apk: Option<PathBuf>,
    config: Option<PathBuf>,
    out: Option<PathBuf>,
    package: Option<String>,
    name: Option<String>,
    icon: Option<PathBuf>,
    keystore: Option<PathBuf>,
    store_pass: Option<String>,
    alias: Option<String>,
    key_pass: Option<String>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut parsed = Args::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if !arg.starts_with('-') {
            if parsed.command.is_empty() {
                parsed.command = arg;
            } else if parsed.apk.is_none() {
                parsed.apk = Some(arg.into());
            } else {
                bail!("unexpected argument: {arg}");
            }
            continue;
        }
        if arg == "-h" || arg == "--help" {
            return Ok(None);
        }
        let value = args
            .next()
            .with_context(|| format!("`{arg}` requires an argument"))?;
        match arg.as_str() {
            "--config" => parsed.config = Some(value.into()),
            "--out" => parsed.out = Some(value.into()),
            "--package" => parsed.package = Some(value),
            "--name" => parsed.name = Some(value),
            "--icon" => parsed.icon = Some(value.into()),
            "--keystore" => parsed.keystore = Some(value.into()),
            "--store-pass" => parsed.store_pass = Some(value),
            "--alias" => parsed.alias = Some(value),
            "--key-pass" => parsed.key_pass = Some(value),
            _ => bail!("unknown argument: {arg}"),
        }
    }
    if parsed.command.is_empty() {
        return Ok(None);
    }
    Ok(Some(parsed))
}

fn print_outcome(outcome: &Outcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

fn credentials(args: &mut Args) -> Result<Option<SigningCredentials>> {
    let Some(keystore) = args.keystore.take() else {
        return Ok(None);
    };
    let store_password = args
        .store_pass
        .take()
        .context("`--keystore` requires `--store-pass`")?;
    let alias = args.alias.take().context("`--keystore` requires `--alias`")?;
    // Alias password defaults to the store password, like keytool
    let key_password = args.key_pass.take().unwrap_or_else(|| store_password.clone());
    Ok(Some(SigningCredentials {
        keystore,
        store_password,
        alias,
        key_password,
    }))
}

fn main() -> Result<()> {
    env_logger::init();
    let Some(mut args) = parse_args()? else {
        println!("{}", USAGE);
        return Ok(());
    };
    let config = match &args.config {
        Some(path) => parse_config(path),
        None => PipelineConfig::default(),
    };
    let engineer = ApkReverseEngineer::new(config);

    match args.command.as_str() {
        "info" => {
            let apk = args.apk.take().context("`info` requires an APK path")?;
            let info = engineer.get_info(&apk)?;
            println!("{}", serde_json::to_string_pretty(&info.to_map())?);
        }
        "repack" => {
            let source = args.apk.take().context("`repack` requires an APK path")?;
            let output = args.out.take().context("`repack` requires `--out`")?;
            let job = Job {
                source,
                output,
                package_name: args.package.take(),
                app_name: args.name.take(),
                icon: args.icon.take(),
                credentials: credentials(&mut args)?,
            };
            print_outcome(&Outcome::from(engineer.run(&job)))?;
        }
        "verify" => {
            let apk = args.apk.take().context("`verify` requires an APK path")?;
            match engineer.verify(&apk) {
                Ok(certificates) => {
                    log::info!("{} signer certificate(s)", certificates.len());
                    print_outcome(&Outcome::from(Ok::<_, String>(())))?;
                }
                Err(err) => print_outcome(&Outcome::from(Err::<(), _>(err)))?,
            }
        }
        "cleanup" => print_outcome(&Outcome::from(engineer.cleanup()))?,
        command => bail!("unknown command `{command}`\n{USAGE}"),
    }
    Ok(())
}
