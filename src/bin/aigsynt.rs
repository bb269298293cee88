use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use parallel_mtbdd::{Edge, Forest, ForestConfig, ReorderType};
use std::path::PathBuf;
use std::time::Instant;

/// Build the output BDD of an and-inverter graph model.
#[derive(Debug, Parser)]
#[command(name = "aigsynt")]
struct Args {
    /// Number of workers (default = 0: autodetect)
    #[arg(short, long, default_value_t = 0)]
    workers: usize,

    /// Enable static (Sloan) variable reordering
    #[arg(short = 's', long = "static-reordering")]
    static_reordering: bool,

    /// Enable dynamic variable reordering
    #[arg(short = 'd', long = "dynamic-reordering")]
    dynamic_reordering: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Give a short usage message
    #[arg(long)]
    usage: bool,

    /// Model file in aag format
    model: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Header {
    m: u64,
    i: u64,
    l: u64,
    o: u64,
    a: u64,
    b: u64,
    c: u64,
    j: u64,
    f: u64,
}

#[derive(Debug, Default)]
struct Aag {
    header: Header,
    inputs: Vec<u64>,
    latches: Vec<(u64, u64)>,
    outputs: Vec<u64>,
    gates: Vec<(u64, u64, u64)>,
    /// Gate index per variable, -1 when the variable is not a gate output.
    gate_of: Vec<i64>,
    controllable: Vec<bool>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn skip(&mut self) {
        self.pos += 1;
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.skip();
        }
    }

    fn skip_ws_nl(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.skip();
        }
    }

    fn token(&mut self, token: &str) -> Result<()> {
        for expected in token.bytes() {
            match self.peek() {
                Some(c) if c == expected => self.skip(),
                _ => bail!("expected `{token}` at offset {}", self.pos),
            }
        }
        Ok(())
    }

    fn uint(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut value = 0u64;
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            value = value * 10 + u64::from(c - b'0');
            self.skip();
        }
        if self.pos == start {
            bail!("expected a number at offset {}", self.pos);
        }
        Ok(value)
    }

    fn line(&mut self) -> String {
        let start = self.pos;
        while !matches!(self.peek(), None | Some(b'\n')) {
            self.skip();
        }
        String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned()
    }
}

fn read_header(reader: &mut Reader) -> Result<Header> {
    let mut header = Header::default();
    reader.skip_ws_nl();
    reader.token("aag")?;
    reader.skip_ws();
    header.m = reader.uint()?;
    reader.skip_ws();
    header.i = reader.uint()?;
    reader.skip_ws();
    header.l = reader.uint()?;
    reader.skip_ws();
    header.o = reader.uint()?;
    reader.skip_ws();
    header.a = reader.uint()?;
    reader.skip_ws();
    for field in [&mut header.b, &mut header.c, &mut header.j, &mut header.f] {
        if !matches!(reader.peek(), None | Some(b'\n') | Some(b'\r')) {
            *field = reader.uint()?;
            reader.skip_ws();
        }
    }
    reader.skip_ws_nl();

    if header.o != 1 {
        bail!("expecting exactly 1 output, model has {}", header.o);
    }
    if header.b != 0 || header.c != 0 || header.j != 0 || header.f != 0 {
        bail!("no support for the extended aag format (B/C/J/F must be 0)");
    }
    Ok(header)
}

fn read_aag(buffer: &[u8]) -> Result<Aag> {
    let mut reader = Reader::new(buffer);
    let header = read_header(&mut reader)?;
    info!(
        "model: {} variables, {} inputs, {} latches, {} and-gates",
        header.m, header.i, header.l, header.a
    );

    let mut aag = Aag {
        gate_of: vec![-1; header.m as usize + 1],
        controllable: vec![false; header.i as usize],
        ..Aag::default()
    };

    for _ in 0..header.i {
        aag.inputs.push(reader.uint()?);
        reader.skip_ws_nl();
    }
    for _ in 0..header.l {
        let latch = reader.uint()?;
        reader.skip_ws();
        let next = reader.uint()?;
        reader.skip_ws_nl();
        aag.latches.push((latch, next));
    }
    for _ in 0..header.o {
        aag.outputs.push(reader.uint()?);
        reader.skip_ws_nl();
    }
    for index in 0..header.a {
        let lhs = reader.uint()?;
        reader.skip_ws();
        let rhs0 = reader.uint()?;
        reader.skip_ws();
        let rhs1 = reader.uint()?;
        reader.skip_ws_nl();
        aag.gate_of[(lhs / 2) as usize] = index as i64;
        aag.gates.push((lhs, rhs0, rhs1));
    }

    // optional symbol table: `i<k>`, `l<k>`, `o<k>` lines; a `controllable_`
    // prefix on an input symbol marks a controllable input
    loop {
        match reader.peek() {
            Some(b'i') | Some(b'l') | Some(b'o') => {
                let kind = reader.peek().unwrap();
                reader.skip();
                let position = reader.uint()?;
                reader.skip_ws();
                let label = reader.line();
                reader.skip_ws_nl();
                if kind == b'i' && label.starts_with("controllable_") {
                    if let Some(flag) = aag.controllable.get_mut(position as usize) {
                        *flag = true;
                    }
                }
            }
            _ => break,
        }
    }

    aag.header = header;
    Ok(aag)
}

/// Resolve an aag literal to an edge, building gate BDDs on demand.
fn literal_edge(
    forest: &mut Forest,
    aag: &Aag,
    memo: &mut Vec<Option<Edge>>,
    dynamic: bool,
    literal: u64,
) -> Result<Edge> {
    if literal == 0 {
        return Ok(Edge::FALSE);
    }
    if literal == 1 {
        return Ok(Edge::TRUE);
    }
    let var = literal / 2;
    let base = match aag.gate_of[var as usize] {
        -1 => forest
            .ithlevel(var as u32 - 1)
            .context("literal exceeds the registered variables")?,
        gate => gate_edge(forest, aag, memo, dynamic, gate as usize)?,
    };
    Ok(if literal & 1 == 1 { base.complemented() } else { base })
}

fn gate_edge(
    forest: &mut Forest,
    aag: &Aag,
    memo: &mut Vec<Option<Edge>>,
    dynamic: bool,
    gate: usize,
) -> Result<Edge> {
    if let Some(edge) = memo[gate] {
        return Ok(edge);
    }
    let (_, rhs0, rhs1) = aag.gates[gate];
    let left = literal_edge(forest, aag, memo, dynamic, rhs0)?;
    let right = literal_edge(forest, aag, memo, dynamic, rhs1)?;
    let result = forest.and(left, right);
    // pin the intermediate result so collections and reordering keep it
    forest.protect(result);
    memo[gate] = Some(result);
    if dynamic {
        forest
            .maybe_reduce_heap()
            .map_err(|e| anyhow::anyhow!("dynamic reordering failed: {e}"))?;
    }
    Ok(result)
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if args.usage {
        println!(
            "Usage: aigsynt [-w <workers>] [-d --dynamic-reordering] [-s --static-reordering]"
        );
        println!("               [-v --verbose] [--help] [--usage] <model>");
        return Ok(());
    }

    let model = args.model.context("no model file given (see --usage)")?;
    let buffer = std::fs::read(&model)
        .with_context(|| format!("cannot read model `{}`", model.display()))?;

    let started = Instant::now();
    let aag = read_aag(&buffer)?;

    if args.static_reordering {
        warn!("static (Sloan) reordering is not available; continuing without it");
    }

    let mut forest = Forest::new(ForestConfig {
        workers: args.workers,
        reorder_type: ReorderType::BoundedSift,
        ..ForestConfig::default()
    });
    info!("using {} workers", forest.workers());

    forest.new_levels(aag.header.m as u32);
    let controllable = aag.controllable.iter().filter(|c| **c).count();
    if controllable > 0 {
        info!(
            "{} of {} inputs are controllable",
            controllable,
            aag.inputs.len()
        );
    }

    let mut memo = vec![None; aag.gates.len()];
    let output = literal_edge(
        &mut forest,
        &aag,
        &mut memo,
        args.dynamic_reordering,
        aag.outputs[0],
    )?;
    forest.protect(output);

    // next-state functions of the latches share the gate memo with the
    // output cone
    let mut transition_nodes = 0usize;
    for (latch, next) in &aag.latches {
        let edge = literal_edge(&mut forest, &aag, &mut memo, args.dynamic_reordering, *next)?;
        forest.protect(edge);
        transition_nodes += forest.node_count(edge);
        info!(
            "latch {}: next-state function has {} nodes",
            latch / 2,
            forest.node_count(edge)
        );
    }
    if !aag.latches.is_empty() {
        info!(
            "{} latches, {} next-state nodes in total",
            aag.latches.len(),
            transition_nodes
        );
    }

    if args.dynamic_reordering {
        forest
            .reduce_heap(ReorderType::BoundedSift)
            .map_err(|e| anyhow::anyhow!("final reordering failed: {e}"))?;
    }

    if args.verbose {
        for (level, count) in forest.level_node_counts().into_iter().enumerate() {
            if count > 0 {
                info!(
                    "level {level} (variable {}): {count} nodes",
                    forest.level_to_variable(level as u32)
                );
            }
        }
    }

    // which states allow the controllable inputs to force the output
    let controllable_labels: Vec<u32> = aag
        .inputs
        .iter()
        .zip(&aag.controllable)
        .filter(|(_, controllable)| **controllable)
        .map(|(literal, _)| forest.variable_to_level((literal / 2 - 1) as u32))
        .collect();
    if !controllable_labels.is_empty() {
        let cube = forest.cube(&controllable_labels);
        forest.protect(cube);
        let forced = forest.exists(output, cube);
        if forced.is_true() {
            println!("the controllable inputs can always force the output");
        } else {
            println!(
                "forcing condition over the uncontrollable variables: {} nodes",
                forest.node_count(forced)
            );
        }
    }

    let (used, total) = forest.table_usage();
    println!(
        "output BDD: {} nodes (table {}/{} slots, {:.2}%) in {:.3}s",
        forest.node_count(output),
        used,
        total,
        used as f64 / total as f64 * 100.0,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::read_aag;

    const TOGGLE: &str = "aag 1 0 1 1 0\n2 3\n2\nl0 toggle\n";

    #[test]
    pub fn parses_a_minimal_model() {
        let aag = read_aag(TOGGLE.as_bytes()).unwrap();
        assert_eq!(aag.header.m, 1);
        assert_eq!(aag.latches, vec![(2, 3)]);
        assert_eq!(aag.outputs, vec![2]);
        assert!(aag.gates.is_empty());
    }

    #[test]
    pub fn rejects_multiple_outputs() {
        assert!(read_aag(b"aag 1 1 0 2 0\n2\n2\n3\n").is_err());
    }

    #[test]
    pub fn rejects_extended_format() {
        assert!(read_aag(b"aag 1 1 0 1 0 1\n2\n2\n").is_err());
    }

    #[test]
    pub fn recognises_controllable_inputs() {
        let model = "aag 2 2 0 1 0\n2\n4\n2\ni0 uncontrollable\ni1 controllable_x\n";
        let aag = read_aag(model.as_bytes()).unwrap();
        assert_eq!(aag.controllable, vec![false, true]);
    }
}
