use super::{core_error, json_pretty, Context, EXIT_SUCCESS};
use serde::Serialize;
use std::path::PathBuf;
use strata_core::{layer_order, CoreError, RecipeGraph};
use strata_schema::{parse_recipe_file, RecipeFile, Substitutions};

#[derive(Debug, Serialize)]
struct OrderEntry {
    file: PathBuf,
    prerequisites: Vec<PathBuf>,
    layers: Vec<String>,
}

fn resolve(files: &[PathBuf]) -> Result<Vec<OrderEntry>, CoreError> {
    let subs = Substitutions::new();
    let parsed = files
        .iter()
        .map(|p| parse_recipe_file(p, &subs))
        .collect::<Result<Vec<RecipeFile>, _>>()?;
    let graph = RecipeGraph::new(&parsed)?;
    let mut entries = Vec::with_capacity(parsed.len());
    for path in graph.sort()? {
        let Some(file) = parsed.iter().find(|f| f.path() == path) else {
            continue;
        };
        entries.push(OrderEntry {
            prerequisites: graph.prerequisites(&path),
            layers: layer_order(file)?,
            file: path,
        });
    }
    Ok(entries)
}

pub fn run(ctx: &Context, files: &[PathBuf]) -> Result<u8, String> {
    let entries = resolve(files).map_err(|e| core_error(&e))?;

    if ctx.json {
        println!("{}", json_pretty(&entries)?);
        return Ok(EXIT_SUCCESS);
    }
    for (i, entry) in entries.iter().enumerate() {
        println!("{:>3}. {}", i + 1, entry.file.display());
        for prereq in &entry.prerequisites {
            println!("       after {}", prereq.display());
        }
        println!("       layers: {}", entry.layers.join(" -> "));
    }
    Ok(EXIT_SUCCESS)
}
