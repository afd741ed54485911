// Integration tests for quarry: script parsing, compilation, execution, selection and images

use proptest::prelude::*;
use quarry::*;

const WORDS: [&str; 5] = ["red", "green", "blue", "apple", "stone"];

fn make_store() -> (MemoryStore, TableId) {
    let store = MemoryStore::new();
    let schema = TableSchemaBuilder::new("docs")
        .key(Domain::ShortText)
        .column("title", Domain::Text)
        .column("body", Domain::LongText)
        .column("size", Domain::Int32)
        .column("price", Domain::Float)
        .index("terms", &["title", "body"])
        .index("sizes", &["size"])
        .build();
    let table = store.create_table(&schema).unwrap();
    let rows = [
        ("k0", "Red apple", "a fruit that is red", 3, 1.5),
        ("k1", "Green apple", "sour and green", 3, 1.0),
        ("k2", "Blue stone", "not edible", 10, 99.0),
        ("k3", "Red stone", "a red gem", 1, 250.0),
        ("k4", "Plain", "", 0, 0.0),
    ];
    for (key, title, body, size, price) in rows {
        let id = store.add_record(table, Value::short_text(key)).unwrap();
        store.set(table, id, "title", Value::text(title)).unwrap();
        store.set(table, id, "body", Value::long_text(body)).unwrap();
        store.set(table, id, "size", Value::Int32(size)).unwrap();
        store.set(table, id, "price", Value::Float(price)).unwrap();
    }
    (store, table)
}

fn compile(store: &MemoryStore, table: TableId, script: &str) -> Expression {
    let registry = FunctionRegistry::with_builtins();
    let mut expr = Expression::for_table(table).unwrap();
    ScriptParser::parse(script, &mut expr, store, &registry).unwrap();
    expr
}

fn eval(script: &str) -> Result<Option<Value>> {
    let (store, table) = make_store();
    let registry = FunctionRegistry::with_builtins();
    let mut expr = Expression::for_table(table)?;
    expr.set_var(0, Value::record(table, 1))?;
    ScriptParser::parse(script, &mut expr, &store, &registry)?;
    let mut ctx = VmContext::default();
    execute(&mut ctx, &mut expr, &store, 0)
}

fn select_with(store: &MemoryStore, table: TableId, expr: &mut Expression, options: SelectOptions) -> ResultSet {
    let mut ctx = VmContext::default();
    table_select(&mut ctx, store, expr, table, None, LogicalOp::Or, &options).unwrap()
}

fn select_ids(script: &str) -> Vec<RecordId> {
    let (store, table) = make_store();
    let mut expr = compile(&store, table, script);
    select_with(&store, table, &mut expr, SelectOptions::default()).ids()
}

#[test]
fn test_select_single_predicates() {
    assert_eq!(select_ids("size == 3"), vec![1, 2]);
    assert_eq!(select_ids("title @ \"red\""), vec![1, 4]);
    assert_eq!(select_ids("title @^ \"Blue\""), vec![3]);
    assert_eq!(select_ids("_key == \"k4\""), vec![5]);
    assert_eq!(select_ids("_id == 2"), vec![2]);
    assert_eq!(select_ids("price > 50"), vec![3, 4]);
}

#[test]
fn test_select_combinators() {
    assert_eq!(select_ids("size == 3 && title @ \"green\""), vec![2]);
    assert_eq!(select_ids("size == 3 || size == 10"), vec![1, 2, 3]);
    assert_eq!(select_ids("title @ \"stone\" &! size == 1"), vec![3]);
    assert_eq!(select_ids("size == 0 || (title @ \"red\" && price < 100)"), vec![1, 5]);
    assert_eq!(select_ids("(size == 3 || size == 1) && (title @ \"red\" || price == 1.0)"), vec![1, 2, 4]);
}

#[test]
fn test_match_scores_count_every_section() {
    let (store, table) = make_store();
    let mut expr = compile(&store, table, "title @ \"red\"");
    let planned = select_with(&store, table, &mut expr, SelectOptions::default());
    let leaves = select_with(&store, table, &mut expr, SelectOptions { planning: true, use_indexes: false });
    assert_eq!(planned.scores(), leaves.scores());
    assert_eq!(planned.scores(), vec![(1, 1), (4, 1)]);
}

#[test]
fn test_select_refines_incoming_set() {
    let (store, table) = make_store();
    let mut first = compile(&store, table, "size < 5");
    let mut ctx = VmContext::default();
    let options = SelectOptions::default();
    let res = table_select(&mut ctx, &store, &mut first, table, None, LogicalOp::Or, &options).unwrap();
    assert_eq!(res.ids(), vec![1, 2, 4, 5]);

    let mut second = compile(&store, table, "title @ \"apple\"");
    let res = table_select(&mut ctx, &store, &mut second, table, Some(res), LogicalOp::And, &options).unwrap();
    assert_eq!(res.ids(), vec![1, 2]);

    let mut third = compile(&store, table, "_key == \"k1\"");
    let res = table_select(&mut ctx, &store, &mut third, table, Some(res), LogicalOp::But, &options).unwrap();
    assert_eq!(res.ids(), vec![1]);
    assert_eq!(ctx.depth(), 0);
}

#[test]
fn test_select_requires_a_variable() {
    let (store, table) = make_store();
    let mut expr = Expression::new();
    let mut ctx = VmContext::default();
    let err = table_select(&mut ctx, &store, &mut expr, table, None, LogicalOp::Or, &SelectOptions::default())
        .unwrap_err();
    assert_eq!(err, QuarryError::InvalidArgument("at least one variable must be defined".to_string()));
}

#[test]
fn test_plan_degrades_to_full_scan() {
    let (store, table) = make_store();
    let mut expr = compile(&store, table, "size * 2 > 5 || length(title) == 5");
    assert!(plan(&expr, &store, LogicalOp::Or, true).unwrap().is_none());
    let res = select_with(&store, table, &mut expr, SelectOptions::default());
    assert_eq!(res.ids(), vec![1, 2, 3, 5]);
}

#[test]
fn test_updates_through_select_results() {
    let (store, table) = make_store();
    let hits = select_ids("size == 3");
    let mut expr = compile(&store, table, "price *= 2");
    assert!(expr.is_taintable());
    let mut ctx = VmContext::default();
    for id in hits {
        expr.set_var(0, Value::record(table, id)).unwrap();
        execute(&mut ctx, &mut expr, &store, 0).unwrap();
        ctx.pop();
    }
    assert_eq!(store.get(table, 1, "price").unwrap(), Value::Float(3.0));
    assert_eq!(store.get(table, 2, "price").unwrap(), Value::Float(2.0));
    assert_eq!(store.get(table, 3, "price").unwrap(), Value::Float(99.0));

    let mut locked = VmContext::new(&EngineConfig::default().with_allow_updates(false));
    let err = execute(&mut locked, &mut expr, &store, 0).unwrap_err();
    assert!(matches!(err, QuarryError::PermissionDenied(_)));
    assert_eq!(locked.depth(), 0);
}

#[test]
fn test_cacheable_and_taintable_flags() {
    let (store, table) = make_store();
    let pure = compile(&store, table, "size + 1");
    assert!(pure.is_cacheable());
    assert!(!pure.is_taintable());

    let call = compile(&store, table, "length(title)");
    assert!(!call.is_cacheable());
    assert!(!call.is_taintable());

    let update = compile(&store, table, "size++");
    assert!(!update.is_cacheable());
    assert!(update.is_taintable());

    // assigning a variable does not write to the store
    let mut var_only = Expression::for_table(table).unwrap();
    let n = var_only.add_var(Some("n")).unwrap();
    var_only.set_var(n, Value::Int32(1)).unwrap();
    ScriptParser::parse("$n = 5", &mut var_only, &store, &FunctionRegistry::new()).unwrap();
    assert!(!var_only.is_taintable());
}

#[test]
fn test_unary_minus_folding() {
    let (store, table) = make_store();
    let expr = compile(&store, table, "-2147483648");
    assert_eq!(expr.code().len(), 1);
    assert_eq!(eval("-2147483648").unwrap(), Some(Value::Int32(i32::MIN)));
    assert_eq!(eval("-2147483649").unwrap(), Some(Value::Int64(-2_147_483_649)));
    assert_eq!(eval("-1.25").unwrap(), Some(Value::Float(-1.25)));
    assert_eq!(eval("-(size)").unwrap(), Some(Value::Int32(-3)));
}

#[test]
fn test_arithmetic_promotion() {
    assert_eq!(eval("1 + 1.5").unwrap(), Some(Value::Float(2.5)));
    assert_eq!(eval("2147483647 + 1").unwrap(), Some(Value::Int32(i32::MIN)));
    assert_eq!(eval("4294967296 + 1").unwrap(), Some(Value::Int64(4_294_967_297)));
    assert_eq!(eval("3 + \"12\"").unwrap(), Some(Value::Int32(15)));
    assert_eq!(eval("7 / 2").unwrap(), Some(Value::Int32(3)));
    assert_eq!(eval("-1 >>> 28").unwrap(), Some(Value::Int32(15)));
    assert_eq!(eval("\"10\" + 5").unwrap(), Some(Value::Int64(15)));
    assert!(matches!(eval("3 + \"x\""), Err(QuarryError::ArithmeticError(_))));
    assert!(matches!(eval("\"a\" * \"b\""), Err(QuarryError::NotImplemented(_))));
}

#[test]
fn test_division_by_zero() {
    let expected = QuarryError::ArithmeticError("dividend should not be 0".to_string());
    assert_eq!(eval("1 / 0").unwrap_err(), expected);
    assert_eq!(eval("1 % 0").unwrap_err(), expected);
    assert_eq!(eval("1.5 / 0").unwrap_err(), expected);
    assert_eq!(eval("size / (size - 3)").unwrap_err(), expected);
}

#[test]
fn test_cross_domain_equality() {
    assert_eq!(eval("1 == 1.0").unwrap(), Some(Value::Int32(1)));
    assert_eq!(eval("\"10\" == 10").unwrap(), Some(Value::Int32(1)));
    assert_eq!(eval("4294967296 == 4294967296.0").unwrap(), Some(Value::Int32(1)));
    assert_eq!(eval("_key == \"k0\"").unwrap(), Some(Value::Int32(1)));
    assert_eq!(eval("price == 1.5").unwrap(), Some(Value::Int32(1)));
    assert_eq!(eval("size != 3").unwrap(), Some(Value::Int32(0)));
    assert_eq!(eval("\"42\" == 42.0").unwrap(), Some(Value::Int32(1)));
    assert_eq!(eval("\"42\" == \"042\"").unwrap(), Some(Value::Int32(0)));
}

#[test]
fn test_stack_overflow_is_reported() {
    let (store, table) = make_store();
    let mut expr = compile(&store, table, "1 + (2 + (3 + (4 + 5)))");
    let mut ctx = VmContext::new(&EngineConfig::default().with_stack_capacity(3));
    let err = execute(&mut ctx, &mut expr, &store, 0).unwrap_err();
    assert!(matches!(err, QuarryError::CapacityExceeded(_)));
    assert_eq!(ctx.depth(), 0);
}

#[test]
fn test_image_roundtrip_per_domain() {
    let (store, table) = make_store();
    let registry = FunctionRegistry::with_builtins();
    let values = [
        Value::Int32(-7),
        Value::Int64(1 << 40),
        Value::Float(3.25),
        Value::short_text("short"),
        Value::long_text("a much longer text value"),
        Value::record(table, 3),
    ];
    for value in values {
        let mut expr = Expression::for_table(table).unwrap();
        let v = expr.add_var(Some("v")).unwrap();
        expr.set_var(v, value.clone()).unwrap();
        let mut c = Compiler::new(&mut expr, &store);
        c.append_var(v, Operator::Push, 1).unwrap();
        c.append_constant(value.clone(), Operator::Push, 1).unwrap();
        c.append_operator(Operator::Equal, 2).unwrap();

        let image = pack(&expr).unwrap();
        let mut back = unpack(&image, &store, &registry, &EngineConfig::default()).unwrap();
        assert_eq!(back.var_value(v), Some(&value));
        assert_eq!(back.to_string(), expr.to_string());
        let mut ctx = VmContext::default();
        assert_eq!(execute(&mut ctx, &mut back, &store, 0).unwrap(), Some(Value::Int32(1)));
    }
}

#[test]
fn test_image_of_script_selects_the_same() {
    let (store, table) = make_store();
    let registry = FunctionRegistry::with_builtins();
    let script = "title @ \"apple\" || (size == 10 &! price < 1)";
    let mut expr = compile(&store, table, script);
    let image = pack(&expr).unwrap();
    let mut back = unpack(&image, &store, &registry, &EngineConfig::default()).unwrap();
    let want = select_with(&store, table, &mut expr, SelectOptions::default()).ids();
    let got = select_with(&store, table, &mut back, SelectOptions::default()).ids();
    assert_eq!(want, vec![1, 2, 3]);
    assert_eq!(got, want);
}

#[test]
fn test_config_from_json() {
    let config: EngineConfig = serde_json::from_str(r#"{"planning": false, "stack_capacity": 16}"#).unwrap();
    assert!(!config.planning);
    assert!(config.use_indexes);
    assert_eq!(config.stack_capacity, 16);
    assert_eq!(config.code_capacity, 1024);
    let options = SelectOptions::from(&config);
    assert_eq!(options, SelectOptions { planning: false, use_indexes: true });

    let json = serde_json::to_string(&config).unwrap();
    let back: EngineConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_value_json_roundtrip() {
    let values = vec![
        Value::Int32(5),
        Value::text("hello"),
        Value::record(FIRST_TABLE_ID, 9),
        Value::Vector { domain: Domain::Int64, items: vec![Value::Int64(1), Value::Int64(2)] },
    ];
    let json = serde_json::to_string(&values).unwrap();
    let back: Vec<Value> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, values);
}

#[test]
fn test_inspect_lists_instructions() {
    let (store, table) = make_store();
    let expr = compile(&store, table, "size == 3");
    let text = expr.to_string();
    assert!(text.contains("value:column(size)"));
    assert!(text.contains(&Operator::Equal.to_string()));
}

#[test]
fn test_compiled_operands_resolve_objects() {
    let (store, table) = make_store();
    assert_eq!(store.table_id("docs"), Some(table));
    assert_eq!(store.table_id("missing"), None);
    let expr = compile(&store, table, "length(title) > 3");
    let operand = |pc: usize| expr.operand_value(expr.code()[pc].value.as_ref().unwrap());
    let callee = operand(0);
    assert_eq!(callee.as_object().and_then(|o| o.as_procedure()).map(|p| p.name()), Some("length"));
    let column = operand(1);
    assert_eq!(column.as_object().and_then(|o| o.as_column()).map(|c| c.name.as_str()), Some("title"));
}

#[derive(Debug, Clone)]
enum Filter {
    Leaf(String),
    Node(Box<Filter>, &'static str, Box<Filter>),
}

impl Filter {
    fn script(&self) -> String {
        match self {
            Filter::Leaf(s) => s.clone(),
            Filter::Node(l, op, r) => format!("({} {} {})", l.script(), op, r.script()),
        }
    }
}

fn leaf() -> impl Strategy<Value = Filter> {
    prop_oneof![
        (0..6i32).prop_map(|n| format!("size == {}", n)),
        (0..6i32).prop_map(|n| format!("size > {}", n)),
        (0..WORDS.len()).prop_map(|i| format!("title @ \"{}\"", WORDS[i])),
        (0..WORDS.len()).prop_map(|i| format!("title @^ \"{}\"", WORDS[i])),
        (0..8u32).prop_map(|n| format!("_key == \"k{}\"", n)),
        (0..3u32).prop_map(|n| format!("_key @^ \"k{}\"", n)),
        (0..10u32).prop_map(|n| format!("_id == {}", n)),
    ]
    .prop_map(Filter::Leaf)
}

fn filter() -> impl Strategy<Value = Filter> {
    leaf().prop_recursive(4, 16, 2, |inner| {
        (inner.clone(), prop_oneof![Just("&&"), Just("||"), Just("&!")], inner)
            .prop_map(|(l, op, r)| Filter::Node(Box::new(l), op, Box::new(r)))
    })
}

fn random_store(rows: &[(u8, i32)]) -> (MemoryStore, TableId) {
    let store = MemoryStore::new();
    let schema = TableSchemaBuilder::new("rows")
        .key(Domain::ShortText)
        .column("title", Domain::Text)
        .column("size", Domain::Int32)
        .index("titles", &["title"])
        .index("sizes", &["size"])
        .build();
    let table = store.create_table(&schema).unwrap();
    for (i, (word, size)) in rows.iter().enumerate() {
        let id = store.add_record(table, Value::short_text(format!("k{}", i))).unwrap();
        let title = format!("{} {}", WORDS[*word as usize % WORDS.len()], WORDS[(*word as usize / 5) % WORDS.len()]);
        store.set(table, id, "title", Value::text(title)).unwrap();
        store.set(table, id, "size", Value::Int32(*size)).unwrap();
    }
    (store, table)
}

proptest! {
    #[test]
    fn parser_does_not_panic_on_random_input(s in ".{0,256}") {
        let (store, table) = make_store();
        let registry = FunctionRegistry::with_builtins();
        let mut expr = Expression::for_table(table).unwrap();
        let _ = ScriptParser::parse(&s, &mut expr, &store, &registry);
    }
}

proptest! {
    #[test]
    fn planned_select_matches_full_scan(
        rows in prop::collection::vec((0u8..25, 0i32..6), 0..12),
        f in filter(),
    ) {
        let (store, table) = random_store(&rows);
        let mut expr = compile(&store, table, &f.script());
        let planned = select_with(&store, table, &mut expr, SelectOptions::default());
        let leaves = select_with(&store, table, &mut expr, SelectOptions { planning: true, use_indexes: false });
        let full = select_with(&store, table, &mut expr, SelectOptions { planning: false, use_indexes: false });
        prop_assert_eq!(planned.scores(), leaves.scores());
        prop_assert_eq!(planned.ids(), full.ids());
    }
}

proptest! {
    #[test]
    fn execution_keeps_the_stack_balanced(
        a in any::<i32>(),
        b in any::<i32>(),
        c in -3i32..3,
        ops in prop::collection::vec(prop_oneof![Just("+"), Just("-"), Just("*"), Just("/"), Just("%"), Just("<<"), Just("&")], 2),
    ) {
        let (store, table) = make_store();
        let script = format!("({} {} {}) {} {}", a, ops[0], b, ops[1], c);
        let registry = FunctionRegistry::new();
        let mut expr = Expression::for_table(table).unwrap();
        ScriptParser::parse(&script, &mut expr, &store, &registry).unwrap();
        let mut ctx = VmContext::default();
        ctx.push(Value::text("caller")).unwrap();
        let outcome = execute(&mut ctx, &mut expr, &store, 0);
        let expected = if outcome.is_ok() { 2 } else { 1 };
        prop_assert_eq!(ctx.depth(), expected);
        prop_assert_eq!(expr.pool().in_use(), 0);
        if outcome.is_ok() {
            ctx.pop();
        }
        prop_assert_eq!(ctx.pop(), Some(Value::text("caller")));
    }
}
