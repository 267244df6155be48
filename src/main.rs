use std::fs::File;
use std::io::{self, BufReader, Read};

use anyhow::{anyhow, Context};
use clap::{App, Arg};
use kaleidoscope_repl::codegen::Codegen;
use kaleidoscope_repl::driver::{Driver, Options};
use kaleidoscope_repl::lexer::Lexer;

/// parse an `OP=PRECEDENCE` pair such as `/=40`
fn parse_operator(pair: &str) -> anyhow::Result<(char, u32)> {
    let (op, precedence) = pair
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("expected OP=PRECEDENCE, found {}", pair))?;

    let mut chars = op.chars();
    let op = match (chars.next(), chars.next()) {
        (Some(op), None) => op,
        _ => return Err(anyhow!("operator must be a single character, found {}", op)),
    };
    let precedence = precedence
        .parse()
        .with_context(|| format!("invalid precedence for '{}'", op))?;

    Ok((op, precedence))
}

fn main() -> anyhow::Result<()> {
    let matches = App::new("kaleidoscope")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("INPUT")
                .help("source file to read instead of standard input")
                .index(1),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .help("only print results and errors"),
        )
        .arg(
            Arg::with_name("operator")
                .short("o")
                .long("operator")
                .value_name("OP=PRECEDENCE")
                .help("register a binary operator precedence, e.g. /=40")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .get_matches();

    let input: Box<dyn Iterator<Item = u8>> = match matches.value_of("INPUT") {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("failed to open {}", path))?;
            Box::new(BufReader::new(file).bytes().map_while(Result::ok))
        }
        None => Box::new(io::stdin().bytes().map_while(Result::ok)),
    };

    let options = if matches.is_present("quiet") {
        Options::quiet()
    } else {
        Options::default()
    };

    let mut driver = Driver::new(Lexer::new(input), Codegen::new(), io::stderr(), options);
    for pair in matches.values_of("operator").into_iter().flatten() {
        let (op, precedence) = parse_operator(pair)?;
        driver.session_mut().set_precedence(op, precedence)?;
    }

    driver.run()?;
    Ok(())
}
