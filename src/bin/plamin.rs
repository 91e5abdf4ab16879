/**************************************************************************/
/*  This file is part of PGM2SSAT.                                        */
/*                                                                        */
/*  Copyright (C) 2025                                                    */
/*    CEA (Commissariat à l'énergie atomique et aux énergies              */
/*         alternatives)                                                  */
/*                                                                        */
/*  you can redistribute it and/or modify it under the terms of the GNU   */
/*  Lesser General Public License as published by the Free Software       */
/*  Foundation, version 2.1.                                              */
/*                                                                        */
/*  It is distributed in the hope that it will be useful,                 */
/*  but WITHOUT ANY WARRANTY; without even the implied warranty of        */
/*  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the         */
/*  GNU Lesser General Public License for more details.                   */
/*                                                                        */
/*  See the GNU Lesser General Public License version 2.1                 */
/*  for more details (enclosed in the file licenses/LGPLv2.1).            */
/*                                                                        */
/**************************************************************************/

use anyhow::Context;
use pgm2ssat::minimize::{Cover, Minimizer, MinimizerKind};
use std::io::Read;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "plamin",
    about = "Minimizes a PLA cover with one of the minimizers of pgm2ssat"
)]
struct Opt {
    /// Input PLA file
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Output PLA file
    #[structopt(parse(from_os_str))]
    output: PathBuf,

    /// Minimizer
    #[structopt(short, long, possible_values = MinimizerKind::VARIANTS, default_value = "qm")]
    minimizer: MinimizerKind,

    /// espresso executable
    #[structopt(long, default_value = "espresso", parse(from_os_str))]
    espresso: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::from_args();
    let mut text = String::new();
    std::fs::File::open(&opts.input)
        .context("opening input file")?
        .read_to_string(&mut text)
        .context("reading input file")?;
    let cover = Cover::from_pla(&text).context("parsing input")?;
    let minimizer = opts.minimizer.build(&opts.espresso);
    let res = minimizer
        .minimize(&cover)
        .with_context(|| format!("minimizing with {}", minimizer.name()))?;
    eprintln!(
        "{} cubes, {} literals -> {} cubes, {} literals",
        cover.rows.len(),
        cover.literal_count(),
        res.rows.len(),
        res.literal_count()
    );
    let out = std::fs::File::create(&opts.output).context("failed to open ouput for writing")?;
    res.write_pla(std::io::BufWriter::new(out))
        .context("writing output")?;
    Ok(())
}
