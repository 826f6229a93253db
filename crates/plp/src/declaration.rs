//! Carrier declaration formatting.
//!
//! Turns a host [`Order`] into the [`Declaration`] submitted to the carrier:
//! declared weight, package profile, normalized parties, content manifest
//! and additional services.

use plp_config::{PackageRule, RuntimeOptions};
use plp_types::{
    AdditionalServices, Declaration, ManifestLine, Order, PackageDims, Party,
};

/// Reasons an order cannot be declared.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeclarationError {
    #[error("sender is not configured (set [sender] name and address in plp.toml)")]
    MissingSender,

    #[error("recipient {0} is missing")]
    MissingRecipientField(&'static str),

    #[error("order {0} has no shippable lines")]
    EmptyOrder(String),

    #[error("no package rules configured")]
    NoPackageRules,
}

/// Weight declared to the carrier, in grams.
///
/// The order's own weight wins; otherwise line weights times quantities are
/// summed. A missing or zero weight falls back to `min_weight_grams`, which
/// is also the floor.
pub fn declared_weight(order: &Order, min_weight_grams: u32) -> u32 {
    let from_lines = order
        .lines
        .iter()
        .map(|line| u64::from(line.weight_grams.unwrap_or(0)) * u64::from(line.quantity))
        .fold(0u64, u64::saturating_add);
    let weight = match order.weight_grams {
        Some(w) if w > 0 => u64::from(w),
        _ => from_lines,
    };
    u32::try_from(weight)
        .unwrap_or(u32::MAX)
        .max(min_weight_grams)
}

/// The lightest rule that takes `weight_grams`, or the heaviest rule when
/// none does. `None` only for an empty rule set.
pub fn select_package(rules: &[PackageRule], weight_grams: u32) -> Option<&PackageRule> {
    rules
        .iter()
        .filter(|rule| rule.max_weight_grams >= weight_grams)
        .min_by_key(|rule| rule.max_weight_grams)
        .or_else(|| rules.iter().max_by_key(|rule| rule.max_weight_grams))
}

/// Build the declaration for `order` with the configured sender, packages
/// and services.
pub fn build_declaration(order: &Order, opts: &RuntimeOptions) -> Result<Declaration, DeclarationError> {
    let sender = normalize_party(&opts.sender);
    if sender.name.is_empty() || sender.address.postal_code.is_empty() {
        return Err(DeclarationError::MissingSender);
    }

    let recipient = normalize_party(&order.recipient);
    check_recipient(&recipient)?;

    let items: Vec<ManifestLine> = order
        .lines
        .iter()
        .filter(|line| line.quantity > 0)
        .map(|line| ManifestLine {
            description: line.description.trim().to_string(),
            quantity: line.quantity,
            unit_value_cents: line.unit_price_cents,
        })
        .collect();
    if items.is_empty() {
        return Err(DeclarationError::EmptyOrder(order.order_ref.clone()));
    }

    let weight = declared_weight(order, opts.collection.min_weight_grams);
    let rule = select_package(&opts.packages, weight).ok_or(DeclarationError::NoPackageRules)?;

    let declared_value_cents = opts.collection.declare_value.then(|| {
        if order.totals.items_cents > 0 {
            order.totals.items_cents
        } else {
            // Saturates at u64::MAX.
            items
                .iter()
                .map(|line| line.unit_value_cents.saturating_mul(u64::from(line.quantity)))
                .fold(0u64, u64::saturating_add)
        }
    });

    Ok(Declaration {
        order_ref: order.order_ref.clone(),
        service_code: opts.carrier.service_code.clone(),
        sender,
        recipient,
        package: PackageDims {
            profile: rule.name.clone(),
            weight_grams: weight,
            height_cm: rule.height_cm,
            width_cm: rule.width_cm,
            length_cm: rule.length_cm,
        },
        items,
        services: AdditionalServices {
            declared_value_cents,
            receipt_notice: opts.collection.receipt_notice,
            own_hands: opts.collection.own_hands,
        },
    })
}

fn check_recipient(party: &Party) -> Result<(), DeclarationError> {
    let required = [
        ("name", party.name.as_str()),
        ("street", party.address.street.as_str()),
        ("city", party.address.city.as_str()),
        ("state", party.address.state.as_str()),
        ("postal code", party.address.postal_code.as_str()),
    ];
    match required.iter().find(|(_, value)| value.is_empty()) {
        Some((field, _)) => Err(DeclarationError::MissingRecipientField(*field)),
        None => Ok(()),
    }
}

/// Trim text fields; keep only digits in postal code, document and phone.
fn normalize_party(party: &Party) -> Party {
    let digits = |s: &str| s.chars().filter(char::is_ascii_digit).collect::<String>();
    let optional_digits = |s: &Option<String>| s.as_deref().map(digits).filter(|d| !d.is_empty());

    let mut out = party.clone();
    out.name = party.name.trim().to_string();
    out.document = optional_digits(&party.document);
    out.phone = optional_digits(&party.phone);
    out.email = party
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string);

    let address = &mut out.address;
    address.street = address.street.trim().to_string();
    address.number = match address.number.trim() {
        "" => "S/N".to_string(),
        number => number.to_string(),
    };
    address.complement = address
        .complement
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    address.district = address.district.trim().to_string();
    address.city = address.city.trim().to_string();
    address.state = address.state.trim().to_uppercase();
    address.postal_code = digits(&address.postal_code);
    address.country = address.country.trim().to_uppercase();
    out
}

#[cfg(test)]
mod tests {
    use plp_types::{Address, OrderLine, OrderTotals};
    use proptest::prelude::*;

    use super::*;

    fn party(name: &str, postal_code: &str) -> Party {
        Party {
            name: name.to_string(),
            document: Some("123.456.789-09".into()),
            phone: None,
            email: Some("  ".into()),
            address: Address {
                street: " Rua das Flores ".into(),
                number: "".into(),
                complement: None,
                district: "Centro".into(),
                city: "Olinda".into(),
                state: "pe".into(),
                postal_code: postal_code.into(),
                country: "br".into(),
            },
        }
    }

    fn line(quantity: u32, weight_grams: Option<u32>) -> OrderLine {
        OrderLine {
            sku: "SKU".into(),
            description: " Ceramic mug ".into(),
            quantity,
            unit_price_cents: 2500,
            weight_grams,
        }
    }

    fn order(lines: Vec<OrderLine>, weight_grams: Option<u32>) -> Order {
        Order {
            order_ref: "o-1".into(),
            recipient: party("Ana Souza", "53020-140"),
            lines,
            weight_grams,
            totals: OrderTotals::default(),
        }
    }

    fn opts() -> RuntimeOptions {
        let mut opts = RuntimeOptions::default();
        opts.sender = party("Loja", "50000-000");
        opts
    }

    fn rule(name: &str, max_weight_grams: u32) -> PackageRule {
        PackageRule {
            name: name.into(),
            max_weight_grams,
            height_cm: 1,
            width_cm: 1,
            length_cm: 1,
        }
    }

    #[test]
    fn weight_prefers_order_then_lines_then_minimum() {
        assert_eq!(declared_weight(&order(vec![line(2, Some(400))], Some(1200)), 300), 1200);
        assert_eq!(declared_weight(&order(vec![line(2, Some(400))], Some(0)), 300), 800);
        assert_eq!(declared_weight(&order(vec![line(2, None)], None), 300), 300);
        assert_eq!(declared_weight(&order(vec![line(1, Some(50))], None), 300), 300);
    }

    #[test]
    fn package_selection_falls_back_to_largest() {
        let rules = vec![rule("m", 5000), rule("s", 1000), rule("l", 30000)];
        assert_eq!(select_package(&rules, 1000).map(|r| r.name.as_str()), Some("s"));
        assert_eq!(select_package(&rules, 1001).map(|r| r.name.as_str()), Some("m"));
        assert_eq!(select_package(&rules, 99_999).map(|r| r.name.as_str()), Some("l"));
        assert!(select_package(&[], 1).is_none());
    }

    #[test]
    fn declaration_is_normalized() {
        let decl = build_declaration(&order(vec![line(2, Some(400))], None), &opts()).expect("declaration");

        assert_eq!(decl.service_code, "03298");
        assert_eq!(decl.package.profile, "small");
        assert_eq!(decl.package.weight_grams, 800);
        assert_eq!(decl.recipient.address.postal_code, "53020140");
        assert_eq!(decl.recipient.address.number, "S/N");
        assert_eq!(decl.recipient.address.state, "PE");
        assert_eq!(decl.recipient.address.street, "Rua das Flores");
        assert_eq!(decl.recipient.document.as_deref(), Some("12345678909"));
        assert_eq!(decl.recipient.email, None);
        assert_eq!(decl.items[0].description, "Ceramic mug");
        assert_eq!(decl.services, AdditionalServices::default());
    }

    #[test]
    fn declared_value_uses_totals_or_lines() {
        let mut opts = opts();
        opts.collection.declare_value = true;
        opts.collection.own_hands = true;

        let mut o = order(vec![line(2, None)], None);
        let decl = build_declaration(&o, &opts).expect("declaration");
        assert_eq!(decl.services.declared_value_cents, Some(5000));
        assert!(decl.services.own_hands);

        o.totals.items_cents = 4500;
        let decl = build_declaration(&o, &opts).expect("declaration");
        assert_eq!(decl.services.declared_value_cents, Some(4500));
    }

    #[test]
    fn declared_value_clamps_instead_of_overflowing() {
        let mut opts = opts();
        opts.collection.declare_value = true;

        let mut huge = line(u32::MAX, None);
        huge.unit_price_cents = u64::MAX / 2;
        let o = order(vec![huge.clone(), huge], None);
        let decl = build_declaration(&o, &opts).expect("declaration");
        assert_eq!(decl.services.declared_value_cents, Some(u64::MAX));
    }

    #[test]
    fn line_weights_clamp_to_u32() {
        let heavy = line(u32::MAX, Some(u32::MAX));
        let o = order(vec![heavy.clone(), heavy], None);
        assert_eq!(declared_weight(&o, 300), u32::MAX);
    }

    #[test]
    fn missing_data_is_reported() {
        let mut no_sender = opts();
        no_sender.sender.name = "  ".into();
        assert_eq!(
            build_declaration(&order(vec![line(1, None)], None), &no_sender),
            Err(DeclarationError::MissingSender)
        );

        let mut o = order(vec![line(1, None)], None);
        o.recipient.address.city = " ".into();
        assert_eq!(
            build_declaration(&o, &opts()),
            Err(DeclarationError::MissingRecipientField("city"))
        );

        let empty = order(vec![line(0, Some(100))], None);
        assert_eq!(
            build_declaration(&empty, &opts()).map_err(|e| e.to_string()),
            Err("order o-1 has no shippable lines".to_string())
        );

        let mut no_rules = opts();
        no_rules.packages.clear();
        assert_eq!(
            build_declaration(&order(vec![line(1, None)], None), &no_rules),
            Err(DeclarationError::NoPackageRules)
        );
    }

    fn rules_strategy() -> impl Strategy<Value = Vec<PackageRule>> {
        prop::collection::vec(1u32..50_000, 1..6).prop_map(|weights| {
            weights
                .into_iter()
                .enumerate()
                .map(|(i, w)| rule(&format!("r{i}"), w))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn selected_rule_is_lightest_that_fits(rules in rules_strategy(), weight in 1u32..60_000) {
            let chosen = select_package(&rules, weight).expect("non-empty rules");
            let fitting: Vec<_> = rules.iter().filter(|r| r.max_weight_grams >= weight).collect();
            if fitting.is_empty() {
                let heaviest = rules.iter().map(|r| r.max_weight_grams).max().expect("max");
                prop_assert_eq!(chosen.max_weight_grams, heaviest);
            } else {
                prop_assert!(chosen.max_weight_grams >= weight);
                prop_assert!(fitting.iter().all(|r| r.max_weight_grams >= chosen.max_weight_grams));
            }
        }

        #[test]
        fn declared_weight_never_below_minimum(
            order_weight in prop::option::of(0u32..100_000),
            line_weight in prop::option::of(0u32..10_000),
            quantity in 0u32..20,
            min in 1u32..2_000,
        ) {
            let o = order(vec![line(quantity, line_weight)], order_weight);
            prop_assert!(declared_weight(&o, min) >= min);
        }
    }
}
