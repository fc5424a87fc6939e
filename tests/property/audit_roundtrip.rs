//! Round-trip and totality properties of the audit parser.
//!
//! The load-bearing property: for any well-formed audit line, parsing and
//! re-serializing is the identity on bytes — numeric spellings included.
//! The parser is also a total function over arbitrary input: it answers
//! `Ok` or a positioned error, never panics.

use proptest::prelude::*;

use scorepipe_rs::AuditRecord;

/// One `namespace^name` element; names may contain ':' but none of the
/// structural bytes `\t`, `*`, `@`, `^`.
fn element_strategy() -> impl Strategy<Value = String> {
    let ident = "[A-Za-z][A-Za-z0-9_:]{0,11}";
    prop_oneof![
        // namespaced
        (ident, ident).prop_map(|(ns, name)| format!("{ns}^{name}")),
        // bare
        ident.prop_map(|name| name.to_string()),
    ]
}

/// Decimal spellings that `f64` parses but whose text must survive the
/// round trip (e.g. "1" must not come back "1.0").
fn number_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        (0u32..1000).prop_map(|n| n.to_string()),
        (-500i32..500, 0u32..10_000).prop_map(|(int, frac)| format!("{int}.{frac:04}")),
        Just("0".to_string()),
        Just("-0.5".to_string()),
        Just("1e-3".to_string()),
    ]
}

fn feature_strategy() -> impl Strategy<Value = String> {
    (
        prop::collection::vec(element_strategy(), 1..4),
        proptest::num::u64::ANY,
        number_strategy(),
        number_strategy(),
        proptest::option::of(number_strategy()),
    )
        .prop_map(|(elements, hash, value, weight, grad)| {
            let mut out = elements.join("*");
            out.push(':');
            out.push_str(&hash.to_string());
            out.push(':');
            out.push_str(&value);
            out.push(':');
            out.push_str(&weight);
            if let Some(grad) = grad {
                out.push('@');
                out.push_str(&grad);
            }
            out
        })
}

fn line_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(feature_strategy(), 1..8).prop_map(|features| features.join("\t"))
}

proptest! {
    /// Parse ∘ serialize is the identity on well-formed lines, and the
    /// contribution count matches the feature count.
    #[test]
    fn well_formed_lines_round_trip(line in line_strategy()) {
        let record = AuditRecord::parse(&line).expect("well-formed line must parse");
        prop_assert_eq!(record.contributions.len(), line.split('\t').count());
        prop_assert_eq!(record.to_wire(), line);
    }

    /// Every parsed contribution exposes finite numerics consistent with
    /// its wire text.
    #[test]
    fn parsed_numerics_are_consistent(line in line_strategy()) {
        let record = AuditRecord::parse(&line).unwrap();
        let mut sum = 0.0f64;
        for c in &record.contributions {
            prop_assert!(c.value.is_finite());
            prop_assert!(c.weight.is_finite());
            sum += c.value * c.weight;
        }
        prop_assert!((record.predicted_score() - sum).abs() <= 1e-9 * sum.abs().max(1.0));
    }

    /// The parser is total: arbitrary single-line input either parses or
    /// produces an error whose column lies within the line.
    #[test]
    fn parser_never_panics(line in "[^\n]{0,200}") {
        match AuditRecord::parse(&line) {
            Ok(record) => {
                // Whatever parsed must re-serialize without panicking.
                let _ = record.to_wire();
            }
            Err(err) => {
                prop_assert!(err.column <= line.len());
            }
        }
    }

    /// Summaries preserve total mass (relative potentials sum to 1 when
    /// any merged feature keeps non-zero potential) and are sorted by
    /// absolute potential, descending.
    #[test]
    fn summary_shares_sum_to_one(line in line_strategy()) {
        let record = AuditRecord::parse(&line).unwrap();
        let summary = record.summarize();
        let total: f64 = summary.iter().map(|e| e.relative_potential).sum();
        let any_mass = summary.iter().any(|e| e.potential != 0.0);
        if any_mass {
            prop_assert!((total - 1.0).abs() < 1e-6, "shares summed to {}", total);
        } else {
            prop_assert_eq!(total, 0.0);
        }
        prop_assert!(summary
            .windows(2)
            .all(|w| w[0].potential.abs() >= w[1].potential.abs()));
    }
}
