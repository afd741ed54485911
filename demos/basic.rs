use quarry::*;

fn main() -> Result<()> {
    // 1. Define a table and load a few records
    let store = MemoryStore::new();
    let schema = TableSchemaBuilder::new("products")
        .key(Domain::ShortText)
        .column("name", Domain::Text)
        .column("stock", Domain::Int32)
        .index("names", &["name"])
        .index("stocks", &["stock"])
        .build();
    let table = store.create_table(&schema)?;
    for (key, name, stock) in [("p1", "Steel hammer", 12), ("p2", "Rubber mallet", 0), ("p3", "Steel saw", 4)] {
        let id = store.add_record(table, Value::short_text(key))?;
        store.set(table, id, "name", Value::text(name))?;
        store.set(table, id, "stock", Value::Int32(stock))?;
    }

    // 2. Compile a filter script against the table
    let registry = FunctionRegistry::with_builtins();
    let mut filter = Expression::for_table(table)?;
    ScriptParser::parse(r#"name @ "steel" && stock > 5"#, &mut filter, &store, &registry)?;
    println!("compiled: {}", filter);

    // 3. Select matching records, with and without the planner
    let mut ctx = VmContext::default();
    let planned = table_select(&mut ctx, &store, &mut filter, table, None, LogicalOp::Or, &SelectOptions::default())?;
    println!("planned select: {:?}", planned.scores());
    let options = SelectOptions { planning: false, use_indexes: false };
    let scanned = table_select(&mut ctx, &store, &mut filter, table, None, LogicalOp::Or, &options)?;
    println!("full scan select: {:?}", scanned.scores());

    // 4. Evaluate an update script for one record
    let mut update = Expression::for_table(table)?;
    ScriptParser::parse("stock += 3", &mut update, &store, &registry)?;
    update.set_var(0, Value::record(table, 2))?;
    execute(&mut ctx, &mut update, &store, 0)?;
    println!("restocked p2: {}", store.get(table, 2, "stock")?);

    // 5. Pack the filter into an image and load it back
    let image = pack(&filter)?;
    let restored = unpack(&image, &store, &registry, &EngineConfig::default())?;
    println!("image of {} bytes restores to: {}", image.len(), restored);
    Ok(())
}
