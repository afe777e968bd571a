use spindle::{yield_now, Coroutine, Status};

const STACK_SIZE: usize = 1024 * 1024;

fn count_to(limit: usize) -> isize {
    for i in 0..limit {
        yield_now(i);
    }
    0
}

fn running_sum(limit: usize) -> isize {
    let mut sum = 0;
    for i in 0..limit {
        sum += i;
        yield_now(sum);
    }
    0
}

#[test]
fn counts_to_five() {
    let mut coroutine = Coroutine::new(count_to, 5, STACK_SIZE);
    let mut statuses = vec![];
    let mut yielded = vec![];

    for _ in 0..6 {
        statuses.push(coroutine.resume());
        yielded.push(coroutine.last_yielded());
    }

    assert_eq!(
        statuses,
        [Status::Waiting, Status::Waiting, Status::Waiting, Status::Waiting, Status::Waiting, Status::Done]
    );
    assert_eq!(yielded, [0, 1, 2, 3, 4, 4]);
}

#[test]
fn accumulates_on_own_stack() {
    let mut coroutine = Coroutine::new(running_sum, 10, STACK_SIZE);

    while coroutine.resume() == Status::Waiting {}

    assert_eq!(coroutine.last_yielded(), 45);
}

#[test]
fn alternates_two_coroutines() {
    let mut short = Coroutine::new(count_to, 5, STACK_SIZE);
    let mut long = Coroutine::new(count_to, 10, STACK_SIZE);
    let (mut short_resumes, mut long_resumes) = (0, 0);
    let (mut short_done, mut long_done) = (false, false);

    while !short_done || !long_done {
        if !short_done {
            short_done = short.resume() == Status::Done;
            short_resumes += 1;
        }
        if !long_done {
            long_done = long.resume() == Status::Done;
            long_resumes += 1;
        }
    }

    assert_eq!(short_resumes, 6);
    assert_eq!(long_resumes, 11);
    assert_eq!(short.last_yielded(), 4);
    assert_eq!(long.last_yielded(), 9);
}

#[test]
fn yields_exactly_as_often_as_asked() {
    for yields in [0, 1, 2, 7, 64] {
        let mut coroutine = Coroutine::new(count_to, yields, STACK_SIZE);

        for _ in 0..yields {
            assert_eq!(coroutine.resume(), Status::Waiting);
        }
        assert_eq!(coroutine.resume(), Status::Done);

        let last = coroutine.last_yielded();
        assert_eq!(coroutine.resume(), Status::Done);
        assert_eq!(coroutine.last_yielded(), last);
    }
}

#[test]
fn destroys_idempotently() {
    let mut coroutine = Coroutine::new(count_to, 3, STACK_SIZE);
    coroutine.resume();

    coroutine.destroy();
    coroutine.destroy();
    drop(coroutine);
}

#[test]
fn runs_on_guarded_stack() {
    let mut coroutine = Coroutine::builder().guard_pages(1).build(running_sum, 10).unwrap();

    while coroutine.resume() == Status::Waiting {}

    assert_eq!(coroutine.last_yielded(), 45);
}
