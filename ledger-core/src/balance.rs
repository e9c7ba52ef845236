//! Pure balance arithmetic. No I/O here: the store applies these transforms
//! under its per-account lock and persists the result.

/// Fixed divisor mapping currency paid to watts credited.
pub const DEFAULT_CONVERSION_RATE: f64 = 500.0;

#[derive(thiserror::Error, Debug)]
pub enum BalanceError {
    #[error("invalid purchase amount: {0}")]
    InvalidAmount(f64),
    #[error("invalid conversion rate: {0}")]
    InvalidRate(f64),
}

/// Result of crediting a purchase against a balance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Credit {
    pub new_balance: f64,
    pub power_credited: f64,
}

/// Round to two decimals, the precision balances are kept at.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Watts credited for a currency amount: `round(amount_paid / rate, 2)`.
///
/// Rejects non-positive (or non-finite) amounts. The rate comes from
/// configuration, so it gets the same guard: a zero or negative divisor
/// must not mint infinite or negative credit.
pub fn credit_amount(amount_paid: f64, rate: f64) -> Result<f64, BalanceError> {
    if !amount_paid.is_finite() || amount_paid <= 0.0 {
        return Err(BalanceError::InvalidAmount(amount_paid));
    }
    if !rate.is_finite() || rate <= 0.0 {
        return Err(BalanceError::InvalidRate(rate));
    }
    Ok(round2(amount_paid / rate))
}

/// Apply a purchase to a balance. Purchases have no upper bound.
pub fn credit_purchase(balance: f64, amount_paid: f64, rate: f64) -> Result<Credit, BalanceError> {
    let power_credited = credit_amount(amount_paid, rate)?;
    Ok(Credit {
        new_balance: round2(balance + power_credited),
        power_credited,
    })
}

/// Apply a consumption debit, clamped at zero.
///
/// Consumption past an empty balance is silently swallowed rather than
/// tracked as overdraft. Devices in the field observe this contract, so it
/// is kept as-is; asymmetric with the unbounded credit side.
pub fn debit_consumption(balance: f64, power_consumed: f64) -> f64 {
    round2((balance - power_consumed).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_amount_divides_by_rate_and_rounds() {
        let credited = credit_amount(1000.0, DEFAULT_CONVERSION_RATE).unwrap();
        assert_eq!(credited, 2.0);

        // 333 / 500 = 0.666 -> 0.67
        let credited = credit_amount(333.0, DEFAULT_CONVERSION_RATE).unwrap();
        assert_eq!(credited, 0.67);
    }

    #[test]
    fn credit_amount_rejects_non_positive_amounts() {
        assert!(matches!(
            credit_amount(0.0, DEFAULT_CONVERSION_RATE),
            Err(BalanceError::InvalidAmount(_))
        ));
        assert!(matches!(
            credit_amount(-25.0, DEFAULT_CONVERSION_RATE),
            Err(BalanceError::InvalidAmount(_))
        ));
        assert!(matches!(
            credit_amount(f64::NAN, DEFAULT_CONVERSION_RATE),
            Err(BalanceError::InvalidAmount(_))
        ));
    }

    #[test]
    fn credit_amount_rejects_degenerate_rates() {
        for rate in [0.0, -500.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                credit_amount(1000.0, rate),
                Err(BalanceError::InvalidRate(_))
            ));
        }
    }

    #[test]
    fn credit_purchase_adds_exactly_the_credited_amount() {
        let credit = credit_purchase(1.5, 1000.0, DEFAULT_CONVERSION_RATE).unwrap();
        assert_eq!(credit.power_credited, 2.0);
        assert_eq!(credit.new_balance, 3.5);
    }

    #[test]
    fn debit_consumption_subtracts_and_never_goes_negative() {
        assert_eq!(debit_consumption(2.0, 0.5), 1.5);
        assert_eq!(debit_consumption(1.5, 5.0), 0.0);
        assert_eq!(debit_consumption(0.0, 0.25), 0.0);

        for (b, c) in [(0.0, 0.0), (10.0, 3.3), (0.01, 0.02), (100.0, 100.0)] {
            let out = debit_consumption(b, c);
            assert!(out >= 0.0);
            assert_eq!(out, round2((b - c).max(0.0)));
        }
    }
}
