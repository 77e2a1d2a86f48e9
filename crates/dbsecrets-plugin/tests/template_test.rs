//! Statement templating and username template laws

use dbsecrets_plugin::query::{query_template, split_unless_multiline, QueryParams};
use dbsecrets_plugin::template::UsernameTemplate;
use dbsecrets_plugin::UsernameMetadata;
use proptest::prelude::*;

fn token() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("{{a}}"),
        Just("{{b}}"),
        Just("{{unknown}}"),
        Just("{"),
        Just("}"),
        Just("x"),
        Just(" "),
    ]
}

proptest! {
    #[test]
    fn prop_query_template_idempotent(
        tokens in prop::collection::vec(token(), 0..16),
        a in "[A-Z ]{0,8}",
        b in "[A-Z ]{0,8}",
    ) {
        let template: String = tokens.concat();
        let params = QueryParams::new().with("a", a).with("b", b);

        let once = query_template(&template, &params);
        let twice = query_template(&once, &params);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_query_template_never_recurses(prefix in "[a-z]{0,6}") {
        let params = QueryParams::new()
            .with("a", format!("{prefix}{{{{b}}}}"))
            .with("b", "B");
        prop_assert_eq!(query_template("{{a}}", &params), format!("{prefix}{{{{b}}}}"));
    }

    #[test]
    fn prop_truncate_bounds(s in "[a-zA-Z0-9]{0,40}", n in 1i64..50) {
        let tpl = UsernameTemplate::new(format!("{{{{ .DisplayName | truncate {n} }}}}")).unwrap();
        let out = tpl.render(&UsernameMetadata::new(s.clone(), "")).unwrap();
        if s.len() <= n as usize {
            prop_assert_eq!(out, s);
        } else {
            prop_assert_eq!(out, s[..n as usize].to_string());
        }
    }
}

#[test]
fn test_non_recursion_literal() {
    let params: QueryParams = [
        ("a", "A{{a}}{{b}}{{c}}{{d}}"),
        ("b", "B{{a}}{{b}}{{c}}{{d}}"),
        ("c", "C{{a}}{{b}}{{c}}{{d}}"),
        ("d", "D{{a}}{{b}}{{c}}{{d}}"),
    ]
    .into_iter()
    .collect();

    assert_eq!(
        query_template("{{a}}{{b}}{{c}}{{d}}", &params),
        "A{{a}}{{b}}{{c}}{{d}}B{{a}}{{b}}{{c}}{{d}}C{{a}}{{b}}{{c}}{{d}}D{{a}}{{b}}{{c}}{{d}}"
    );
}

#[test]
fn test_truncate_sha256_literal() {
    let tpl = UsernameTemplate::new(r#"{{ "thisisareallylongstring" | truncate_sha256 9 }}"#).unwrap();
    assert_eq!(tpl.render(&UsernameMetadata::default()).unwrap(), "t4bb25641");

    let tpl = UsernameTemplate::new(r#"{{ "short" | truncate_sha256 20 }}"#).unwrap();
    assert_eq!(tpl.render(&UsernameMetadata::default()).unwrap(), "short");

    let tpl = UsernameTemplate::new(r#"{{ "short" | truncate_sha256 8 }}"#).unwrap();
    assert!(tpl.render(&UsernameMetadata::default()).is_err());
}

#[test]
fn test_procedure_body_kept_whole() {
    let body = r#"CREATE OR REPLACE PROCEDURE p() AS $$
BEGIN
  RAISE NOTICE 'done; really';
END;
$$ LANGUAGE plpgsql;"#;
    assert_eq!(split_unless_multiline(body).len(), 1);

    let plain = r#"CREATE ROLE "x"; GRANT SELECT ON t TO "x";"#;
    assert_eq!(
        split_unless_multiline(plain),
        vec![r#"CREATE ROLE "x""#, r#"GRANT SELECT ON t TO "x""#]
    );

    let quoted = r#"COMMENT ON ROLE "x" IS 'the END'; SELECT 1;"#;
    assert_eq!(split_unless_multiline(quoted).len(), 2);
}
