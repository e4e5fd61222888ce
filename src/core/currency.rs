use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Currency {
    pub code: &'static str,
    pub name: &'static str,
}

const fn currency(code: &'static str, name: &'static str) -> Currency {
    Currency { code, name }
}

/// Currencies the card network publishes conversion rates for.
pub static CURRENCIES: &[Currency] = &[
    currency("AED", "UAE Dirham"),
    currency("ARS", "Argentine Peso"),
    currency("AUD", "Australian Dollar"),
    currency("BDT", "Bangladeshi Taka"),
    currency("BGN", "Bulgarian Lev"),
    currency("BRL", "Brazilian Real"),
    currency("CAD", "Canadian Dollar"),
    currency("CHF", "Swiss Franc"),
    currency("CLP", "Chilean Peso"),
    currency("CNY", "Chinese Yuan Renminbi"),
    currency("COP", "Colombian Peso"),
    currency("CZK", "Czech Koruna"),
    currency("DKK", "Danish Krone"),
    currency("EGP", "Egyptian Pound"),
    currency("EUR", "Euro"),
    currency("GBP", "Pound Sterling"),
    currency("HKD", "Hong Kong Dollar"),
    currency("HUF", "Hungarian Forint"),
    currency("IDR", "Indonesian Rupiah"),
    currency("ILS", "Israeli New Shekel"),
    currency("INR", "Indian Rupee"),
    currency("ISK", "Icelandic Krona"),
    currency("JPY", "Japanese Yen"),
    currency("KES", "Kenyan Shilling"),
    currency("KRW", "South Korean Won"),
    currency("KWD", "Kuwaiti Dinar"),
    currency("LKR", "Sri Lankan Rupee"),
    currency("MOP", "Macanese Pataca"),
    currency("MXN", "Mexican Peso"),
    currency("MYR", "Malaysian Ringgit"),
    currency("NGN", "Nigerian Naira"),
    currency("NOK", "Norwegian Krone"),
    currency("NZD", "New Zealand Dollar"),
    currency("PEN", "Peruvian Sol"),
    currency("PHP", "Philippine Peso"),
    currency("PKR", "Pakistani Rupee"),
    currency("PLN", "Polish Zloty"),
    currency("QAR", "Qatari Riyal"),
    currency("RON", "Romanian Leu"),
    currency("SAR", "Saudi Riyal"),
    currency("SEK", "Swedish Krona"),
    currency("SGD", "Singapore Dollar"),
    currency("THB", "Thai Baht"),
    currency("TRY", "Turkish Lira"),
    currency("TWD", "New Taiwan Dollar"),
    currency("UAH", "Ukrainian Hryvnia"),
    currency("USD", "US Dollar"),
    currency("VND", "Vietnamese Dong"),
    currency("ZAR", "South African Rand"),
];

pub fn lookup(code: &str) -> Option<&'static Currency> {
    let code = code.trim();
    CURRENCIES.iter().find(|c| c.code.eq_ignore_ascii_case(code))
}

/// Shortest prefix also matched against currency names.
const MIN_NAME_PREFIX: usize = 2;

/// Currencies whose code starts with `prefix`, followed by those with a word
/// in their name starting with it. Single letters only match codes. An empty
/// prefix lists everything.
pub fn search(prefix: &str) -> Vec<&'static Currency> {
    let prefix = prefix.trim().to_ascii_lowercase();
    if prefix.is_empty() {
        return CURRENCIES.iter().collect();
    }

    let by_code = CURRENCIES
        .iter()
        .filter(|c| c.code.to_ascii_lowercase().starts_with(&prefix));
    let match_names = prefix.chars().count() >= MIN_NAME_PREFIX;
    let by_name = CURRENCIES.iter().filter(|c| {
        match_names
            && !c.code.to_ascii_lowercase().starts_with(&prefix)
            && c.name
                .to_ascii_lowercase()
                .split_whitespace()
                .any(|word| word.starts_with(&prefix))
    });
    by_code.chain(by_name).collect()
}
