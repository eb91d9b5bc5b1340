//! Tests for named SQL compilation

use proptest::prelude::*;
use rivven_dbkit::prelude::*;

// ==================== Placeholders ====================

#[test]
fn test_colon_and_hash_forms() {
    let parsed =
        ParsedSql::parse("UPDATE t SET a = :a, b = #{b.c} WHERE id = :id AND a <> :a").unwrap();

    assert_eq!(parsed.named_parameters(), ["a", "b.c", "id", "a"]);
    assert_eq!(parsed.parameter_count(), 4);
    assert_eq!(
        parsed.parameterized_sql(),
        "UPDATE t SET a = ?, b = ? WHERE id = ? AND a <> ?"
    );
    assert_eq!(parsed.indices_of("a").as_ref(), &[1, 4]);
    assert!(parsed.indices_of("missing").is_empty());
    assert_eq!(parsed.operation(), SqlOperation::Update);
}

#[test]
fn test_placeholder_styles() {
    let parsed = ParsedSql::parse("SELECT * FROM t WHERE a = :a AND b = :b").unwrap();

    assert_eq!(
        parsed.positional_sql(PlaceholderStyle::Dollar),
        "SELECT * FROM t WHERE a = $1 AND b = $2"
    );
    assert_eq!(
        parsed.positional_sql(PlaceholderStyle::AtP),
        "SELECT * FROM t WHERE a = @p1 AND b = @p2"
    );
    assert_eq!(
        parsed.positional_sql(PlaceholderStyle::QuestionMark),
        parsed.parameterized_sql()
    );
}

#[test]
fn test_literals_and_comments_untouched() {
    let sql = "SELECT ':no', \"col:x\", x::text -- :nope\nFROM t /* :skip */ WHERE y = :yes";
    let parsed = ParsedSql::parse(sql).unwrap();

    assert_eq!(parsed.named_parameters(), ["yes"]);
    assert_eq!(
        parsed.parameterized_sql(),
        "SELECT ':no', \"col:x\", x::text -- :nope\nFROM t /* :skip */ WHERE y = ?"
    );
}

#[test]
fn test_doubled_quote_escape() {
    let parsed = ParsedSql::parse("SELECT 'it''s :not' WHERE a = :a").unwrap();
    assert_eq!(parsed.named_parameters(), ["a"]);
}

#[test]
fn test_plain_question_marks() {
    let parsed = ParsedSql::parse("INSERT INTO t VALUES (?, ?, ?)").unwrap();
    assert_eq!(parsed.parameter_count(), 3);
    assert!(!parsed.is_named());
    assert_eq!(
        parsed.positional_sql(PlaceholderStyle::Dollar),
        "INSERT INTO t VALUES ($1, $2, $3)"
    );
}

#[test]
fn test_no_parameters() {
    let parsed = ParsedSql::parse("SELECT 1").unwrap();
    assert_eq!(parsed.parameter_count(), 0);
    assert_eq!(parsed.parameterized_sql(), "SELECT 1");
}

// ==================== Errors ====================

#[test]
fn test_unterminated_constructs() {
    for sql in [
        "SELECT 'open",
        "SELECT \"open",
        "SELECT 1 /* open",
        "SELECT #{open",
    ] {
        let err = ParsedSql::parse(sql).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }), "sql = {}", sql);
    }
}

#[test]
fn test_mixed_placeholders_rejected() {
    let err = ParsedSql::parse("SELECT * FROM t WHERE a = ? AND b = :b").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

// ==================== Binding Plan ====================

#[test]
fn test_binding_plan_built_lazily_for_wide_statements() {
    let parsed =
        ParsedSql::parse("INSERT INTO t VALUES (:a, :b, :c, :d, :e, :a)").unwrap();
    assert!(!parsed.has_binding_plan());
    assert_eq!(parsed.indices_of("a").as_ref(), &[1, 6]);
    assert!(parsed.has_binding_plan());
    assert_eq!(parsed.binding_plan().len(), 5);

    let narrow = ParsedSql::parse("SELECT :a, :b").unwrap();
    assert_eq!(narrow.indices_of("b").as_ref(), &[2]);
    assert!(!narrow.has_binding_plan());
}

// ==================== Cache ====================

#[test]
fn test_cache_shares_and_bounds() {
    let cache = ParsedSqlCache::new(2);
    let a = cache.get_or_parse("SELECT :a").unwrap();
    let again = cache.get_or_parse("SELECT :a").unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &again));

    cache.get_or_parse("SELECT :b").unwrap();
    cache.get_or_parse("SELECT :c").unwrap();
    assert_eq!(cache.len(), 2);

    let uncached = ParsedSqlCache::new(0);
    uncached.get_or_parse("SELECT :a").unwrap();
    assert!(uncached.is_empty());
}

#[test]
fn test_cache_does_not_store_failures() {
    let cache = ParsedSqlCache::new(10);
    assert!(cache.get_or_parse("SELECT 'x").is_err());
    assert!(cache.is_empty());
}

// ==================== Properties ====================

fn names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(prop::sample::select(vec!["a", "b", "cc", "d_1", "e.f"]), 1..12)
        .prop_map(|v| v.into_iter().map(String::from).collect())
}

proptest! {
    #[test]
    fn prop_names_and_positions_preserved(names in names()) {
        let predicates: Vec<String> = names
            .iter()
            .enumerate()
            .map(|(i, n)| format!("c{} = :{}", i, n))
            .collect();
        let sql = format!("SELECT * FROM t WHERE {}", predicates.join(" AND "));
        let parsed = ParsedSql::parse(&sql).unwrap();

        prop_assert_eq!(parsed.named_parameters(), names.as_slice());
        prop_assert_eq!(parsed.parameter_count(), names.len());
        prop_assert_eq!(parsed.parameterized_sql().matches('?').count(), names.len());

        for name in &names {
            let expected: Vec<usize> = names
                .iter()
                .enumerate()
                .filter(|(_, n)| *n == name)
                .map(|(i, _)| i + 1)
                .collect();
            prop_assert_eq!(parsed.indices_of(name).into_owned(), expected);
        }
    }

    #[test]
    fn prop_dollar_rendering_numbers_every_placeholder(names in names()) {
        let sql = format!(
            "SELECT {}",
            names.iter().map(|n| format!(":{}", n)).collect::<Vec<_>>().join(", ")
        );
        let parsed = ParsedSql::parse(&sql).unwrap();
        let dollar = parsed.positional_sql(PlaceholderStyle::Dollar);
        for i in 1..=names.len() {
            let placeholder = format!("${}", i);
            prop_assert!(dollar.contains(&placeholder));
        }
        prop_assert!(!dollar.contains(':'));
    }
}
