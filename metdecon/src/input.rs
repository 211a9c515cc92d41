use crate::common::*;

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

/// One input file: paired methylated/depth counts over marker regions.
///
/// On disk the table is markers-as-rows: a header line naming each
/// entity (tissue or sample) twice, once for its methylated column and
/// once for its depth column, then one line per marker region
/// (`chrom-start-end`) with the paired counts. Gzipped files are
/// handled transparently.
pub struct CountTable {
    /// entities x markers
    pub methylated: Mat,
    /// entities x markers
    pub depths: Mat,
    pub entity_names: Vec<Box<str>>,
    pub marker_names: Vec<Box<str>>,
}

fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)?;
    if input_file.ends_with(".gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub fn load_count_table(input_file: &str) -> anyhow::Result<CountTable> {
    let reader = open_buf_reader(input_file)?;
    let mut lines = reader.lines();

    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("{}: empty file", input_file))??;
    let entity_names = parse_header(&header, input_file)?;
    let n_entities = entity_names.len();

    let mut marker_names: Vec<Box<str>> = Vec::new();
    let mut meth_rows: Vec<Vec<f32>> = Vec::new();
    let mut depth_rows: Vec<Vec<f32>> = Vec::new();

    for (lineno, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let marker = fields
            .next()
            .ok_or_else(|| anyhow::anyhow!("{}: blank marker on line {}", input_file, lineno + 2))?;

        let values: Vec<f32> = fields
            .map(|w| {
                w.parse::<f32>().map_err(|_| {
                    anyhow::anyhow!(
                        "{}: unparsable count '{}' on line {}",
                        input_file,
                        w,
                        lineno + 2
                    )
                })
            })
            .collect::<anyhow::Result<_>>()?;

        if values.len() != 2 * n_entities {
            anyhow::bail!(
                "{}: line {} has {} count fields, expected {}",
                input_file,
                lineno + 2,
                values.len(),
                2 * n_entities
            );
        }

        let mut meth = Vec::with_capacity(n_entities);
        let mut depth = Vec::with_capacity(n_entities);
        for (k, pair) in values.chunks_exact(2).enumerate() {
            let (m, d) = (pair[0], pair[1]);
            if m < 0.0 || d < 0.0 {
                anyhow::bail!("{}: negative count on line {}", input_file, lineno + 2);
            }
            if m > d {
                anyhow::bail!(
                    "{}: methylated count {} exceeds depth {} for '{}' on line {}",
                    input_file,
                    m,
                    d,
                    entity_names[k],
                    lineno + 2
                );
            }
            meth.push(m);
            depth.push(d);
        }

        marker_names.push(marker.into());
        meth_rows.push(meth);
        depth_rows.push(depth);
    }

    if marker_names.is_empty() {
        anyhow::bail!("{}: no marker rows", input_file);
    }

    // file is markers x entities; the model wants entities x markers
    let n_markers = marker_names.len();
    let methylated = Mat::from_fn(n_entities, n_markers, |t, j| meth_rows[j][t]);
    let depths = Mat::from_fn(n_entities, n_markers, |t, j| depth_rows[j][t]);

    Ok(CountTable {
        methylated,
        depths,
        entity_names,
        marker_names,
    })
}

fn parse_header(header: &str, input_file: &str) -> anyhow::Result<Vec<Box<str>>> {
    let words: Vec<&str> = header.split('\t').collect();
    if words.len() < 3 || (words.len() - 1) % 2 != 0 {
        anyhow::bail!(
            "{}: header must name a marker column plus two columns per entity",
            input_file
        );
    }
    let mut names = Vec::with_capacity((words.len() - 1) / 2);
    for pair in words[1..].chunks_exact(2) {
        if pair[0] != pair[1] {
            anyhow::bail!(
                "{}: column pair '{}'/'{}' does not name the same entity",
                input_file,
                pair[0],
                pair[1]
            );
        }
        names.push(pair[0].into());
    }
    Ok(names)
}

/// Write a count table in the same markers-as-rows layout we read.
pub fn write_count_table(table: &CountTable, output_file: &str) -> anyhow::Result<()> {
    let mut buf = BufWriter::new(File::create(output_file)?);

    let mut header = vec!["marker".to_string()];
    for name in table.entity_names.iter() {
        header.push(name.to_string());
        header.push(name.to_string());
    }
    writeln!(buf, "{}", header.join("\t"))?;

    for (j, marker) in table.marker_names.iter().enumerate() {
        let mut fields = vec![marker.to_string()];
        for t in 0..table.entity_names.len() {
            fields.push(format!("{}", table.methylated[(t, j)]));
            fields.push(format!("{}", table.depths[(t, j)]));
        }
        writeln!(buf, "{}", fields.join("\t"))?;
    }
    buf.flush()?;
    Ok(())
}

/// The atlas and cohort must cover the same marker regions, compared
/// on the chromosome and start components of `chrom-start-end` names.
pub fn validate_matching_markers(atlas: &CountTable, cfdna: &CountTable) -> anyhow::Result<()> {
    if atlas.marker_names.len() != cfdna.marker_names.len() {
        anyhow::bail!(
            "atlas has {} markers but cfdna file has {}",
            atlas.marker_names.len(),
            cfdna.marker_names.len()
        );
    }
    for (a, c) in atlas.marker_names.iter().zip(cfdna.marker_names.iter()) {
        let a_parts: Vec<&str> = a.split('-').collect();
        let c_parts: Vec<&str> = c.split('-').collect();
        if a_parts.first() != c_parts.first() || a_parts.get(1) != c_parts.get(1) {
            anyhow::bail!("marker regions differ in the two input files: {} and {}", a, c);
        }
    }
    Ok(())
}
