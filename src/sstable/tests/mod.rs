mod tests_basic;
mod tests_get;
mod tests_scan;


// Priority 3 — hardening (edge cases)
mod tests_hardening;
